mod options;
mod rig_transport;
mod transport;

pub use options::{
    ApiDialect, DEFAULT_API_TYPE, DEFAULT_AZURE_API_VERSION, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
    ModelCapabilities, ModelOptions, OptionsResolver, SessionContext, StaticOptionsResolver,
};
pub use rig_transport::{RIG_TRANSPORT_NAME, RigTransport};
pub use transport::{
    CompletionRequest, CompletionTransport, DeltaStream, PromptMessage, PromptRole, StreamEvent,
    StreamHandle, StreamWorker, TransportError, TransportResult, make_delta_stream,
};
