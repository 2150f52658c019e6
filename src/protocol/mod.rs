pub mod envelope;
pub mod events;
pub mod opcodes;

pub use envelope::Envelope;
pub use events::ClientEvent;
