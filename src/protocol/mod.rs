//! Wallet side of the app connection protocol: deeplinks, manifests, wire
//! messages and encrypted replies.

pub mod deeplink;
pub mod manifest;
pub mod messages;
pub mod request;
pub mod response;

pub use self::deeplink::{
    ConnectItem, ConnectRequestPayload, ConnectionParameters, ProtocolVersion, parse,
};
pub use self::manifest::{HttpManifestLoader, Manifest, ManifestLoader};
pub use self::messages::{DeviceInfo, ErrorCode, RequestReply};
pub use self::request::{AppRequest, IncomingRequest, SendTransactionParams};
pub use self::response::ResponseBuilder;
