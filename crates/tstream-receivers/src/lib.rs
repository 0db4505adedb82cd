// Receiver subsystem: sockets shared per port, line framing per sender,
// and logical listeners that turn frames into pipeline records.

mod framing;
mod listener;
mod parser;
mod receiver;

pub use framing::{FRAGMENT_BUFFER_CAP, LineFramer, RawFrame, TransportProtocol, sender_key};
pub use listener::{EventListener, ListenerHandle};
pub use parser::{classify_event, parse_fields, process_frame};
pub use receiver::{
    MAX_RESTART_ATTEMPTS, PortReceiver, RESTART_DELAY, ReceiverManager, ReceiverState,
};
