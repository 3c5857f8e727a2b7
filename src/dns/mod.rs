pub mod codec;
pub mod enums;
pub mod header;
pub mod message;
pub mod question;
pub mod record;

pub use enums::{Opcode, Rcode, RecordClass, RecordType};
pub use header::Header;
pub use message::Message;
pub use question::{Name, Question};
pub use record::{RData, Record};
