use petfeeder_shared::types::Connection;

/// Connected users across all transports, and which one holds control.
///
/// Control goes to the first user to connect. When the holder leaves it
/// passes to the longest-connected remaining user.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// In connection order.
    connections: Vec<Connection>,
    control: Option<Connection>,
}

impl ConnectionRegistry {
    /// Returns `true` if the new connection was granted control.
    pub fn on_connect(&mut self, connection: Connection) -> bool {
        if self.connections.contains(&connection) {
            return false;
        }
        self.connections.push(connection.clone());

        if self.control.is_none() {
            self.control = Some(connection);
            return true;
        }
        false
    }

    /// Returns the connection control was transferred to, if any.
    pub fn on_disconnect(&mut self, connection: &Connection) -> Option<Connection> {
        self.connections.retain(|c| c != connection);

        if self.control.as_ref() != Some(connection) {
            return None;
        }
        self.control = self.connections.first().cloned();
        self.control.clone()
    }

    pub fn holds_control(&self, connection: &Connection) -> bool {
        self.control.as_ref() == Some(connection)
    }

    pub fn controller(&self) -> Option<&Connection> {
        self.control.as_ref()
    }

    pub fn contains(&self, connection: &Connection) -> bool {
        self.connections.contains(connection)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
