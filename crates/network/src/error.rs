use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to build swarm: {0}")]
    SwarmBuildError(String),
    #[error("failed to listen: {0}")]
    ListenError(String),
    #[error("failed to subscribe: {0}")]
    SubscribeError(String),
    #[error("failed to dial: {0}")]
    DialError(String),
    #[error("invalid bootstrap address: {0}")]
    InvalidAddress(String),
    #[error("gossip driver unavailable")]
    DriverClosed,
}
