pub mod actor;
pub mod writer;

pub use actor::{
    Emit, GetSnapshot, RegisterHandler, RemoveHandler, SessionActor, SessionArgs, SessionCommand,
    SessionSnapshot,
};
pub use writer::{WriterWrite, WriterWriteBatch, WsWriterActor};
