pub mod connector;
pub mod form_directory;
pub mod manual_packet;
pub mod registry;

pub use connector::{
    ActionRequest, Capability, Connector, ConnectorFailure, SubmitContext, SubmitOutcome,
    ValidationReport,
};
pub use form_directory::{FormDirectoryConnector, GENERIC_FORM_KEY};
pub use manual_packet::{ManualPacketConnector, MANUAL_PACKET_KEY};
pub use registry::ConnectorRegistry;
