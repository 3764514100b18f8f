//! In-memory collaborators for driving `ConnectionService` end to end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde_json::{Value, json};
use url::Url;

use tonlink::bridge::{BridgeClient, BridgeEvent, OutgoingMessage};
use tonlink::chain::{ChainService, Emulation, NftItem};
use tonlink::config::DeviceConfig;
use tonlink::crypto::SessionCrypto;
use tonlink::error::{BridgeError, ChainError, ManifestError, StorageError};
use tonlink::protocol::{ConnectionParameters, IncomingRequest, Manifest, ManifestLoader};
use tonlink::store::{AppRegistry, CursorStore, MemoryVault, ReplyOutbox, Vault};
use tonlink::transfer::ChainMessage;
use tonlink::wallet::{Network, StaticKeyProvider, Wallet, WalletAddress, WalletKind};
use tonlink::{Collaborators, ConnectionService};

pub const TTL_SECS: u64 = 300;

// ── Bridge ──────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingBridge {
    sent: Mutex<Vec<OutgoingMessage>>,
    failing: AtomicBool,
}

impl RecordingBridge {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last(&self) -> OutgoingMessage {
        self.sent().last().cloned().expect("a message was sent")
    }
}

#[async_trait]
impl BridgeClient for RecordingBridge {
    async fn send(&self, message: OutgoingMessage) -> Result<(), BridgeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::SendFailed {
                to: message.to,
                reason: "relay unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

// ── Chain ───────────────────────────────────────────────────

/// Hands out seqnos in order and records everything it is asked to do.
pub struct ScriptedChain {
    seqnos: Mutex<VecDeque<u32>>,
    emulation: Mutex<Emulation>,
    nfts: Mutex<Result<Vec<NftItem>, String>>,
    emulated: Mutex<Vec<ChainMessage>>,
    broadcasts: Mutex<Vec<ChainMessage>>,
    broadcast_failures: AtomicUsize,
    emulate_fails: AtomicBool,
    seqno_calls: AtomicUsize,
}

impl ScriptedChain {
    pub fn new(seqnos: &[u32]) -> Self {
        Self {
            seqnos: Mutex::new(seqnos.iter().copied().collect()),
            emulation: Mutex::new(Emulation::default()),
            nfts: Mutex::new(Ok(Vec::new())),
            emulated: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            broadcast_failures: AtomicUsize::new(0),
            emulate_fails: AtomicBool::new(false),
            seqno_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_emulation(&self, emulation: Emulation) {
        *self.emulation.lock().unwrap() = emulation;
    }

    pub fn set_nfts(&self, nfts: Result<Vec<NftItem>, String>) {
        *self.nfts.lock().unwrap() = nfts;
    }

    pub fn fail_next_broadcasts(&self, count: usize) {
        self.broadcast_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_emulate_fails(&self, fails: bool) {
        self.emulate_fails.store(fails, Ordering::SeqCst);
    }

    pub fn emulated(&self) -> Vec<ChainMessage> {
        self.emulated.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<ChainMessage> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn seqno_calls(&self) -> usize {
        self.seqno_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainService for ScriptedChain {
    async fn seqno(&self, _wallet: &WalletAddress) -> Result<u32, ChainError> {
        self.seqno_calls.fetch_add(1, Ordering::SeqCst);
        let mut seqnos = self.seqnos.lock().unwrap();
        match seqnos.len() {
            0 => Err(ChainError::RequestFailed {
                endpoint: "seqno".to_string(),
                reason: "no seqno scripted".to_string(),
            }),
            1 => Ok(seqnos[0]),
            _ => Ok(seqnos.pop_front().unwrap_or_default()),
        }
    }

    async fn emulate(&self, message: &ChainMessage) -> Result<Emulation, ChainError> {
        self.emulated.lock().unwrap().push(message.clone());
        if self.emulate_fails.load(Ordering::SeqCst) {
            return Err(ChainError::Rejected {
                reason: "emulation aborted".to_string(),
            });
        }
        Ok(self.emulation.lock().unwrap().clone())
    }

    async fn broadcast(&self, message: &ChainMessage) -> Result<(), ChainError> {
        let remaining = self.broadcast_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.broadcast_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::RequestFailed {
                endpoint: "/v2/blockchain/message".to_string(),
                reason: "timeout".to_string(),
            });
        }
        self.broadcasts.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn nfts(&self, _addresses: &[WalletAddress]) -> Result<Vec<NftItem>, ChainError> {
        self.nfts
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| ChainError::RequestFailed {
                endpoint: "/v2/nfts/_bulk".to_string(),
                reason,
            })
    }
}

// ── Manifest ────────────────────────────────────────────────

pub struct StaticManifests {
    manifest: Option<Manifest>,
    loads: AtomicUsize,
}

impl StaticManifests {
    pub fn serving(manifest: Manifest) -> Self {
        Self {
            manifest: Some(manifest),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            manifest: None,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestLoader for StaticManifests {
    async fn load(&self, url: &Url) -> Result<Manifest, ManifestError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.manifest
            .clone()
            .ok_or_else(|| ManifestError::Unreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

// ── Vault ───────────────────────────────────────────────────

/// Memory vault whose writes can be switched off.
#[derive(Default)]
pub struct SwitchableVault {
    inner: MemoryVault,
    writes_fail: AtomicBool,
    writes: AtomicUsize,
}

impl SwitchableVault {
    pub fn set_writes_fail(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Vault for SwitchableVault {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(StorageError::IoFailure {
                key: key.to_string(),
                reason: "disk full".to_string(),
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }
}

// ── Harness ─────────────────────────────────────────────────

pub fn manifest() -> Manifest {
    serde_json::from_value(json!({
        "url": "https://dapp.example",
        "name": "Example DEX",
        "iconUrl": "https://dapp.example/icon.png"
    }))
    .expect("manifest")
}

pub fn wallet(key: &SigningKey, kind: WalletKind) -> Wallet {
    Wallet {
        name: "Main wallet".to_string(),
        address: WalletAddress::new(0, [0x11; 32]),
        public_key: key.verifying_key().to_bytes(),
        kind,
        network: Network::Mainnet,
        state_init: "te6ccstateinit".to_string(),
    }
}

pub fn recipient() -> WalletAddress {
    WalletAddress::new(0, [0x22; 32])
}

pub struct Harness {
    pub service: ConnectionService,
    pub bridge: Arc<RecordingBridge>,
    pub chain: Arc<ScriptedChain>,
    pub manifests: Arc<StaticManifests>,
    pub vault: Arc<SwitchableVault>,
    pub registry: Arc<AppRegistry>,
    pub cursor: Arc<CursorStore>,
    pub outbox: Arc<ReplyOutbox>,
    pub key: SigningKey,
    pub wallet: Wallet,
    /// The app's side of the session.
    pub app: SessionCrypto,
}

impl Harness {
    pub fn new(seqnos: &[u32]) -> Self {
        Self::with_manifests(seqnos, StaticManifests::serving(manifest()))
    }

    pub fn with_manifests(seqnos: &[u32], manifests: StaticManifests) -> Self {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let wallet = wallet(&key, WalletKind::Regular);

        let bridge = Arc::new(RecordingBridge::default());
        let chain = Arc::new(ScriptedChain::new(seqnos));
        let manifests = Arc::new(manifests);
        let vault = Arc::new(SwitchableVault::default());
        let registry = Arc::new(AppRegistry::new(vault.clone()));
        let cursor = Arc::new(CursorStore::new(vault.clone()));
        let outbox = Arc::new(ReplyOutbox::new(vault.clone()));
        let keys = Arc::new(StaticKeyProvider::new().with_key(wallet.address, key.clone()));

        let service = ConnectionService::new(
            Collaborators {
                manifests: manifests.clone(),
                bridge: bridge.clone(),
                chain: chain.clone(),
                keys,
                registry: registry.clone(),
                cursor: cursor.clone(),
                outbox: outbox.clone(),
            },
            TTL_SECS,
            &DeviceConfig::default(),
        );

        Self {
            service,
            bridge,
            chain,
            manifests,
            vault,
            registry,
            cursor,
            outbox,
            key,
            wallet,
            app: SessionCrypto::generate(),
        }
    }

    pub fn client_id(&self) -> String {
        self.app.session_id().to_string()
    }

    pub fn deeplink(&self) -> String {
        let payload = json!({
            "manifestUrl": "https://dapp.example/tonconnect-manifest.json",
            "items": [{"name": "ton_addr"}, {"name": "ton_proof", "payload": "challenge"}]
        });
        format!(
            "tc://?v=2&id={}&r={}&ret=none",
            self.client_id(),
            urlencoding::encode(&payload.to_string())
        )
    }

    pub async fn connect(&self) -> ConnectionParameters {
        let (parameters, manifest) = self
            .service
            .start_handshake(&self.deeplink())
            .await
            .expect("handshake");
        self.service
            .connect(&self.wallet, &parameters, &manifest)
            .await
            .expect("connect");
        parameters
    }

    /// Decrypt a message the wallet sent to the app.
    pub fn open(&self, message: &OutgoingMessage) -> Value {
        assert_eq!(message.to, self.client_id());
        let plaintext = self
            .app
            .open(&message.body, message.from.as_str())
            .expect("app can decrypt");
        serde_json::from_slice(&plaintext).expect("json")
    }

    /// Encrypt a request from the app to the wallet's connected session.
    pub async fn event(&self, event_id: &str, request: Value) -> BridgeEvent {
        let apps = self
            .registry
            .get(&self.wallet.address)
            .await
            .expect("registry");
        let session = apps
            .iter()
            .find(|app| app.client_id == self.client_id())
            .expect("connected")
            .key_pair
            .session_id();
        let body = self
            .app
            .seal(request.to_string().as_bytes(), session.as_str())
            .expect("seal");
        BridgeEvent {
            id: event_id.to_string(),
            from: self.client_id(),
            message: body,
        }
    }

    pub async fn receive_transfer(&self, event_id: &str, request_id: &str) -> IncomingRequest {
        let event = self.event(event_id, transfer_request(request_id, 1)).await;
        self.service
            .receive_event(&self.wallet, event)
            .await
            .expect("receive")
            .expect("a transaction request")
    }
}

/// `sendTransaction` envelope with `messages` transfers of 1 TON.
pub fn transfer_request(request_id: &str, messages: usize) -> Value {
    let params = json!({
        "valid_until": Utc::now().timestamp() + 600,
        "messages": (0..messages)
            .map(|_| json!({"address": recipient().to_raw(), "amount": "1000000000"}))
            .collect::<Vec<_>>(),
    });
    json!({
        "method": "sendTransaction",
        "params": [params.to_string()],
        "id": request_id,
    })
}
