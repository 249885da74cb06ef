pub mod bignum;
pub mod config;
pub mod driver;
mod error;
pub mod handles;
pub mod hybrid;
pub mod key;
pub mod offload;
pub mod runtime;
pub mod session;
pub mod text;

pub use config::{FlushConfig, OffloadConfig, PollConfig};
pub use driver::{AcceleratorDriver, EmulatedAccelerator, EmulatorConfig};
pub use error::{
    ConfigError, ContextError, HardwareError, PaillierError, SessionError, SubmitError,
};
pub use handles::{CipherTextId, HandleError, KeyPairId, PlainTextId};
pub use hybrid::{HybridConfig, HybridMode};
pub use key::{KeyPair, PrivateKey, PublicKey};
pub use offload::{
    ModExpExecutor, OffloadContext, OffloadStats, OperationKind, SoftwareExecutor,
};
pub use runtime::{
    GlobalExecutor, initialize_context, is_context_active, set_hybrid_mode, set_hybrid_off,
    terminate_context,
};
pub use session::Session;
pub use text::{CipherText, PlainText};
