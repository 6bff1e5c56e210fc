use murmur_net::NetError;
use murmur_shared::StateError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Nothing selected to send to")]
    NoSelection,

    #[error("Client has shut down")]
    Closed,
}
