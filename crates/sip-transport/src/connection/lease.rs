use std::ops::Deref;
use std::sync::Arc;

use super::Connection;

/// Holds one reference on a connection for as long as it lives.
///
/// The idle clock of the connection starts when the last lease is dropped.
#[derive(Debug)]
pub struct ConnectionLease {
    connection: Arc<dyn Connection>,
}

impl ConnectionLease {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        connection.add_reference();
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

impl Clone for ConnectionLease {
    fn clone(&self) -> Self {
        Self::new(self.connection.clone())
    }
}

impl Deref for ConnectionLease {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.connection.remove_reference();
    }
}
