/*!
# Discovery Protocol - Frames, commandes et config partagées

Bibliothèque commune au listener et aux registrants :
- Framing checksummé (CRC32) lecture/écriture async
- Vocabulaire de commandes et statuts (REGISTER, HEARTBEAT, ...)
- NodeInfo annoncé par les registrants
- Config store clé/valeur
*/

pub mod codec;
pub mod command;
pub mod error;
pub mod node;
pub mod store;

pub use codec::{decode, encode, parse_frame, FrameReader, FrameWriter};
pub use command::{Command, Message, Reply, Status};
pub use error::{ProtocolError, Result};
pub use node::NodeInfo;
pub use store::ConfigStore;
