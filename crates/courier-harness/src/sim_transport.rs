//! [`Transport`] implementation backed by a [`SimServer`](crate::SimServer).

use std::sync::{Arc, Mutex};

use courier_client::{Credentials, Link, Transport, TransportError};
use tracing::trace;

use crate::sim_server::{ConnectOutcome, ServerState, accept, lock};

/// Client end of a [`SimServer`](crate::SimServer).
///
/// Obtained from [`SimServer::transport`](crate::SimServer::transport).
#[derive(Clone)]
pub struct SimTransport {
    state: Arc<Mutex<ServerState>>,
}

impl SimTransport {
    pub(crate) fn new(state: Arc<Mutex<ServerState>>) -> Self {
        Self { state }
    }
}

impl Transport for SimTransport {
    fn open(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let state = Arc::clone(&self.state);
        let has_token = !credentials.token().is_empty();

        async move {
            let scripted = lock(&state).next_outcome();
            let outcome = if has_token { scripted } else { ConnectOutcome::Reject };
            trace!(?outcome, "connect attempt");

            match outcome {
                ConnectOutcome::Accept => Ok(accept(&state)),
                ConnectOutcome::Reject => {
                    Err(TransportError::Rejected("credentials refused".into()))
                },
                ConnectOutcome::Unreachable => {
                    Err(TransportError::Connection("server unreachable".into()))
                },
                ConnectOutcome::Hang => std::future::pending().await,
            }
        }
    }
}
