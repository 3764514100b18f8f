//! Connection orchestration: handshake, incoming requests, preview,
//! confirmation and cancellation.

mod preview;
mod tracker;

pub use self::preview::{
    Preview, PreviewAction, TON_DECIMALS, nanotons_to_ton, referenced_nfts, scale_units,
};
pub use self::tracker::{ConfirmClaim, RequestKey, RequestState, RequestTracker};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::bridge::{BridgeClient, BridgeEvent, OutgoingMessage};
use crate::chain::ChainService;
use crate::config::DeviceConfig;
use crate::crypto::{SessionCrypto, SessionId};
use crate::error::{Error, ProtocolError, RequestError, Result};
use crate::protocol::messages::ErrorCode;
use crate::protocol::request::decode_envelope;
use crate::protocol::{
    AppRequest, ConnectionParameters, DeviceInfo, IncomingRequest, Manifest, ManifestLoader,
    ResponseBuilder, SendTransactionParams,
};
use crate::store::{AppRegistry, ConnectedApp, CursorStore, PendingReply, ReplyOutbox};
use crate::transfer::{ChainMessage, SendMode, SigningStrategy, TransactionMessageBuilder};
use crate::wallet::{KeyProvider, Wallet};

/// How long a transfer stays valid when the app does not say.
pub const DEFAULT_VALIDITY_SECS: u64 = 300;

/// External collaborators and stores the service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub manifests: Arc<dyn ManifestLoader>,
    pub bridge: Arc<dyn BridgeClient>,
    pub chain: Arc<dyn ChainService>,
    pub keys: Arc<dyn KeyProvider>,
    pub registry: Arc<AppRegistry>,
    pub cursor: Arc<CursorStore>,
    pub outbox: Arc<ReplyOutbox>,
}

/// Why a transfer is being built. Decides the signing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPurpose {
    Emulate,
    Confirm,
}

/// Whether an automatic reply reached the relay.
enum Delivery {
    Sent,
    /// Queued in the outbox; carries the relay error.
    Queued(Error),
}

impl Delivery {
    fn into_result(self) -> Result<()> {
        match self {
            Self::Sent => Ok(()),
            Self::Queued(e) => Err(e),
        }
    }
}

pub struct ConnectionService {
    manifests: Arc<dyn ManifestLoader>,
    bridge: Arc<dyn BridgeClient>,
    chain: Arc<dyn ChainService>,
    keys: Arc<dyn KeyProvider>,
    registry: Arc<AppRegistry>,
    cursor: Arc<CursorStore>,
    outbox: Arc<ReplyOutbox>,
    responses: ResponseBuilder,
    builder: TransactionMessageBuilder,
    tracker: RequestTracker,
    ttl_secs: u64,
    max_messages: usize,
}

impl ConnectionService {
    /// Finished requests are remembered for `ttl_secs`, the time the relay
    /// may still redeliver them.
    pub fn new(collaborators: Collaborators, ttl_secs: u64, device: &DeviceConfig) -> Self {
        Self {
            manifests: collaborators.manifests,
            bridge: collaborators.bridge,
            chain: collaborators.chain,
            keys: collaborators.keys,
            registry: collaborators.registry,
            cursor: collaborators.cursor,
            outbox: collaborators.outbox,
            responses: ResponseBuilder::new(DeviceInfo::from_config(device)),
            builder: TransactionMessageBuilder::new(device.max_messages),
            tracker: RequestTracker::new(Duration::from_secs(ttl_secs)),
            ttl_secs,
            max_messages: device.max_messages,
        }
    }

    pub fn request_state(&self, request: &IncomingRequest) -> Option<RequestState> {
        self.tracker.state(&key_for(request))
    }

    /// Parse the deeplink and load the app's manifest. Nothing is persisted.
    pub async fn start_handshake(
        &self,
        deeplink: &str,
    ) -> Result<(ConnectionParameters, Manifest)> {
        let parameters = crate::protocol::parse(deeplink)?;
        let manifest = self.manifests.load(parameters.manifest_url()).await?;
        tracing::info!(
            client_id = %parameters.client_id,
            app = %manifest.name,
            "Loaded manifest for connection request"
        );
        Ok((parameters, manifest))
    }

    /// Complete the handshake.
    ///
    /// The app is persisted before the connect event goes out. If the relay
    /// rejects the event the registry is restored to its previous contents
    /// and the bridge error is returned; it is retryable.
    pub async fn connect(
        &self,
        wallet: &Wallet,
        parameters: &ConnectionParameters,
        manifest: &Manifest,
    ) -> Result<ConnectedApp> {
        if !wallet.can_sign() {
            return Err(ProtocolError::UnsupportedWalletKind {
                kind: wallet.kind.to_string(),
            }
            .into());
        }
        let signing_key = self.keys.signing_key(wallet).await?;

        let session = SessionCrypto::generate();
        let now = Utc::now();
        let body = self.responses.connect_success(
            parameters.items(),
            wallet,
            &session,
            &signing_key,
            manifest,
            &parameters.client_id,
            now,
        )?;

        let app = ConnectedApp {
            client_id: parameters.client_id.clone(),
            manifest: manifest.clone(),
            key_pair: session.key_pair().clone(),
            connected_at: now,
        };
        let previous = self
            .registry
            .find(&wallet.address, &parameters.client_id)
            .await?;
        self.registry.add(&wallet.address, app.clone()).await?;

        if let Err(e) = self
            .transmit(session.session_id(), &parameters.client_id, body)
            .await
        {
            tracing::warn!(
                client_id = %parameters.client_id,
                wallet = %wallet.address,
                error = %e,
                "Connect event was not delivered, rolling back"
            );
            let rollback = match previous {
                Some(previous) => self.registry.add(&wallet.address, previous).await,
                None => self
                    .registry
                    .remove(&wallet.address, &parameters.client_id)
                    .await
                    .map(|_| ()),
            };
            if let Err(rollback_err) = rollback {
                tracing::error!(
                    client_id = %parameters.client_id,
                    wallet = %wallet.address,
                    error = %rollback_err,
                    "Failed to roll back connected app"
                );
            }
            return Err(e);
        }

        tracing::info!(
            client_id = %app.client_id,
            wallet = %wallet.address,
            session_id = %session.session_id(),
            "Connected app"
        );
        Ok(app)
    }

    pub async fn connected_apps(&self, wallet: &Wallet) -> Result<Vec<ConnectedApp>> {
        Ok(self.registry.get(&wallet.address).await?)
    }

    /// Forget an app and tell it, best effort. Returns whether it was known.
    pub async fn disconnect(&self, wallet: &Wallet, client_id: &str) -> Result<bool> {
        let Some(app) = self.registry.find(&wallet.address, client_id).await? else {
            return Ok(false);
        };
        let removed = self.registry.remove(&wallet.address, client_id).await?;
        self.forget_client(client_id).await;

        let session = app.session();
        match self.responses.disconnect(&session, client_id, Utc::now()) {
            Ok(body) => {
                if let Err(e) = self.transmit(session.session_id(), client_id, body).await {
                    tracing::warn!(
                        client_id = %client_id,
                        error = %e,
                        "Disconnect event not delivered"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    error = %e,
                    "Could not build disconnect event"
                );
            }
        }
        tracing::info!(client_id = %client_id, wallet = %wallet.address, "Disconnected app");
        Ok(removed)
    }

    /// Drop every app of a deleted wallet. Apps are not notified.
    pub async fn forget_wallet(&self, wallet: &Wallet) -> Result<()> {
        let apps = self.registry.get(&wallet.address).await?;
        self.registry.remove_all(&wallet.address).await?;
        for app in &apps {
            self.forget_client(&app.client_id).await;
        }
        tracing::info!(wallet = %wallet.address, "Forgot all connected apps");
        Ok(())
    }

    /// Drop in-memory and queued state of an app that is gone.
    async fn forget_client(&self, client_id: &str) {
        let requests = self.tracker.forget_client(client_id);
        if let Err(e) = self.outbox.discard_client(client_id).await {
            tracing::warn!(client_id = %client_id, error = %e, "Could not discard queued replies");
        }
        tracing::debug!(client_id = %client_id, requests, "Forgot app requests");
    }

    pub async fn last_event_id(&self) -> Result<Option<String>> {
        Ok(self.cursor.last_event_id().await?)
    }

    /// Returns whether the cursor moved.
    pub async fn save_last_event_id(&self, event_id: &str) -> Result<bool> {
        Ok(self.cursor.save(event_id).await?)
    }

    /// Handle one bridge event addressed to `wallet`'s sessions.
    ///
    /// Returns the transaction request waiting for the user, or `None` when
    /// the event needed no user action: a replay, an unknown sender, a
    /// `disconnect`, or a request that was answered with an error.
    ///
    /// If an automatic error reply cannot be delivered it is queued in the
    /// outbox, the event is consumed and the relay error is returned. Queued
    /// replies are retried before every event.
    pub async fn receive_event(
        &self,
        wallet: &Wallet,
        event: BridgeEvent,
    ) -> Result<Option<IncomingRequest>> {
        if let Err(e) = self.flush_pending_replies().await {
            tracing::warn!(error = %e, "Could not drain reply outbox");
        }

        if !event.id.is_empty() && self.cursor.has_seen(&event.id).await? {
            tracing::debug!(event_id = %event.id, "Skipping replayed bridge event");
            return Ok(None);
        }

        let Some(app) = self.registry.find(&wallet.address, &event.from).await? else {
            tracing::warn!(
                event_id = %event.id,
                client_id = %event.from,
                wallet = %wallet.address,
                "Bridge event from an app this wallet is not connected to"
            );
            self.advance_cursor(&event.id).await?;
            return Ok(None);
        };

        let session = app.session();
        let envelope = match session
            .open(&event.message, &event.from)
            .map_err(Error::from)
            .and_then(|plaintext| decode_envelope(&plaintext).map_err(Error::from))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                // Nothing to address a reply to; consume the event and report.
                self.advance_cursor(&event.id).await?;
                return Err(e);
            }
        };
        let request_id = envelope.id.clone();
        let key = RequestKey::new(&app.client_id, &request_id);

        let request = match AppRequest::try_from(envelope) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    client_id = %app.client_id,
                    error = %e,
                    "Rejecting malformed app request"
                );
                let delivery = self.auto_reply(&app, &request_id, ErrorCode::BadRequest).await?;
                self.tracker.mark_sent(key);
                self.advance_cursor(&event.id).await?;
                return delivery.into_result().map(|()| None);
            }
        };

        let incoming = match request {
            AppRequest::SendTransaction { id, params } => {
                self.tracker.register(key);
                tracing::info!(
                    request_id = %id,
                    client_id = %app.client_id,
                    "Received transaction request"
                );
                Some(IncomingRequest { id, params, app })
            }
            AppRequest::Disconnect { id } => {
                self.registry.remove(&wallet.address, &app.client_id).await?;
                let acked = match self.responses.disconnect_ack(&session, &id, &app.client_id) {
                    Ok(body) => {
                        self.transmit(session.session_id(), &app.client_id, body)
                            .await
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = acked {
                    tracing::warn!(request_id = %id, error = %e, "Disconnect ack not delivered");
                }
                self.forget_client(&app.client_id).await;
                tracing::info!(client_id = %app.client_id, "App disconnected");
                None
            }
            AppRequest::Unsupported { id, method } => {
                tracing::warn!(request_id = %id, method = %method, "Unsupported app method");
                let delivery = self
                    .auto_reply(&app, &id, ErrorCode::MethodNotSupported)
                    .await?;
                self.tracker.mark_sent(key);
                self.advance_cursor(&event.id).await?;
                return delivery.into_result().map(|()| None);
            }
        };

        self.advance_cursor(&event.id).await?;
        Ok(incoming)
    }

    /// Retry replies the relay refused earlier, oldest first. Stops at the
    /// first failure; returns how many went out.
    pub async fn flush_pending_replies(&self) -> Result<usize> {
        let pending = self.outbox.pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered = Vec::new();
        for reply in pending {
            let sent = self
                .transmit(reply.from.clone(), &reply.to, reply.body.clone())
                .await;
            if let Err(e) = sent {
                tracing::debug!(
                    client_id = %reply.to,
                    request_id = %reply.request_id,
                    error = %e,
                    "Relay still refusing queued reply"
                );
                break;
            }
            delivered.push(reply);
        }

        self.outbox.remove(&delivered).await?;
        if !delivered.is_empty() {
            tracing::info!(delivered = delivered.len(), "Delivered queued replies");
        }
        Ok(delivered.len())
    }

    /// Emulate the request with a non-binding signature.
    ///
    /// Any failure is reported as `RequestError::PreviewFailed` and leaves
    /// the request in `emulating`.
    pub async fn preview_request(
        &self,
        wallet: &Wallet,
        request: &IncomingRequest,
    ) -> Result<Preview> {
        let key = key_for(request);
        self.tracker.begin_preview(&key)?;

        let preview = self
            .emulate(wallet, request)
            .await
            .map_err(|e| RequestError::PreviewFailed {
                request_id: request.id.clone(),
                reason: e.to_string(),
            })?;

        self.tracker.finish_preview(&key);
        Ok(preview)
    }

    async fn emulate(&self, wallet: &Wallet, request: &IncomingRequest) -> Result<Preview> {
        let params = request.primary_params()?;
        let message = self
            .build_message(wallet, params, BuildPurpose::Emulate)
            .await?;
        let emulation = self.chain.emulate(&message).await?;

        let nft_addresses = referenced_nfts(&emulation);
        let nfts = if nft_addresses.is_empty() {
            Vec::new()
        } else {
            match self.chain.nfts(&nft_addresses).await {
                Ok(nfts) => nfts,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id,
                        error = %e,
                        "NFT lookup failed, preview without NFT details"
                    );
                    Vec::new()
                }
            }
        };

        Ok(Preview::from_emulation(
            &request.id,
            &request.app.manifest.name,
            wallet,
            &emulation,
            &nfts,
        ))
    }

    /// Sign with the wallet key, broadcast, then answer the app.
    ///
    /// A failed broadcast releases the request and sends nothing. If the
    /// broadcast went through but the reply did not, a retry re-sends the
    /// reply without broadcasting again.
    pub async fn confirm_request(
        &self,
        wallet: &Wallet,
        request: &IncomingRequest,
    ) -> Result<ChainMessage> {
        if !wallet.can_sign() {
            return Err(ProtocolError::UnsupportedWalletKind {
                kind: wallet.kind.to_string(),
            }
            .into());
        }
        let key = key_for(request);

        let message = match self.tracker.claim_confirm(&key)? {
            ConfirmClaim::AlreadyBroadcast(message) => {
                tracing::info!(request_id = %request.id, "Re-sending reply for broadcast request");
                message
            }
            ConfirmClaim::Fresh => match self.sign_and_broadcast(wallet, request).await {
                Ok(message) => message,
                Err(e) => {
                    self.tracker.release(&key);
                    return Err(e);
                }
            },
        };

        let session = request.app.session();
        let sent = match self.responses.transaction_success(
            &session,
            &message,
            &request.id,
            &request.app.client_id,
        ) {
            Ok(body) => {
                self.transmit(session.session_id(), &request.app.client_id, body)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.tracker.park_broadcast(&key, message);
            return Err(e);
        }

        self.tracker.mark_sent(key);
        tracing::info!(
            request_id = %request.id,
            client_id = %request.app.client_id,
            "Transaction confirmed"
        );
        Ok(message)
    }

    async fn sign_and_broadcast(
        &self,
        wallet: &Wallet,
        request: &IncomingRequest,
    ) -> Result<ChainMessage> {
        let params = request.primary_params()?;
        let message = self
            .build_message(wallet, params, BuildPurpose::Confirm)
            .await?;
        self.chain
            .broadcast(&message)
            .await
            .map_err(|e| RequestError::broadcast_failed(&request.id, &e))?;
        Ok(message)
    }

    /// Answer the app with "user declined". Relay failures are logged only.
    pub async fn cancel_request(&self, request: &IncomingRequest) -> Result<()> {
        let key = key_for(request);
        self.tracker.claim_cancel(&key)?;

        if let Err(e) = self
            .reply_error(&request.app, &request.id, ErrorCode::UserDeclined)
            .await
        {
            tracing::warn!(
                request_id = %request.id,
                client_id = %request.app.client_id,
                error = %e,
                "Decline was not delivered"
            );
        }
        self.tracker.mark_sent(key);
        Ok(())
    }

    /// Validate, fetch a fresh seqno and build the transfer. This is the
    /// only place a signing strategy is chosen.
    async fn build_message(
        &self,
        wallet: &Wallet,
        params: &SendTransactionParams,
        purpose: BuildPurpose,
    ) -> Result<ChainMessage> {
        let now = Utc::now().timestamp().max(0) as u64;
        params.validate(wallet, now, self.max_messages)?;

        let strategy = match purpose {
            BuildPurpose::Emulate => SigningStrategy::NoOp,
            BuildPurpose::Confirm => {
                if !wallet.can_sign() {
                    return Err(ProtocolError::UnsupportedWalletKind {
                        kind: wallet.kind.to_string(),
                    }
                    .into());
                }
                SigningStrategy::RealKey(self.keys.signing_key(wallet).await?)
            }
        };

        let seqno = self.chain.seqno(&wallet.address).await?;
        let valid_until = params.valid_until.unwrap_or(now + DEFAULT_VALIDITY_SECS);
        let valid_until = u32::try_from(valid_until).unwrap_or(u32::MAX);

        Ok(self.builder.build(
            wallet,
            seqno,
            valid_until,
            &params.messages,
            params.from.as_ref(),
            SendMode::default(),
            &strategy,
        )?)
    }

    async fn reply_error(
        &self,
        app: &ConnectedApp,
        request_id: &str,
        code: ErrorCode,
    ) -> Result<()> {
        let session = app.session();
        let body = self
            .responses
            .transaction_error(&session, code, request_id, &app.client_id)?;
        self.transmit(session.session_id(), &app.client_id, body)
            .await
    }

    /// Send an automatic error reply, queueing it if the relay refuses.
    async fn auto_reply(
        &self,
        app: &ConnectedApp,
        request_id: &str,
        code: ErrorCode,
    ) -> Result<Delivery> {
        let session = app.session();
        let body = self
            .responses
            .transaction_error(&session, code, request_id, &app.client_id)?;
        match self
            .transmit(session.session_id(), &app.client_id, body.clone())
            .await
        {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                self.outbox
                    .push(PendingReply {
                        from: session.session_id(),
                        to: app.client_id.clone(),
                        request_id: request_id.to_string(),
                        body,
                    })
                    .await?;
                tracing::warn!(
                    request_id = %request_id,
                    client_id = %app.client_id,
                    error = %e,
                    "Reply not delivered, queued for retry"
                );
                Ok(Delivery::Queued(e))
            }
        }
    }

    async fn transmit(&self, from: SessionId, to: &str, body: String) -> Result<()> {
        self.bridge
            .send(OutgoingMessage {
                from,
                to: to.to_string(),
                ttl_secs: self.ttl_secs,
                body,
            })
            .await?;
        Ok(())
    }

    async fn advance_cursor(&self, event_id: &str) -> Result<()> {
        if !event_id.is_empty() {
            self.cursor.save(event_id).await?;
        }
        Ok(())
    }
}

fn key_for(request: &IncomingRequest) -> RequestKey {
    RequestKey::new(&request.app.client_id, &request.id)
}
