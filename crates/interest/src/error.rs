use liveworld_common::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterestError {
    #[error("{0} is not connected")]
    UnknownSession(SessionId),
    #[error("{0} is already connected")]
    AlreadyConnected(SessionId),
    #[error("{0} lacks editor privilege")]
    NotEditor(SessionId),
}
