use crate::{
    cmd::{cmd, Cmd},
    config::{ClientConfig, ProtocolVersion, ServerCredentials},
    error::{Error, Result},
};

/// Per-connection context: which database commands land in, who we
/// authenticate as and what the server knows us by.
///
/// Only the dispatcher task mutates it, and only once the server has
/// acknowledged the command that caused the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    database: u32,
    database_count: Option<u32>,
    client_name: Option<String>,
    credentials: Option<ServerCredentials>,
    protocol: ProtocolVersion,
    closed: bool,
}

/// A change to [`ConnectionState`] that takes effect when its command succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    Database(u32),
    ClientName(Option<String>),
    Password(String),
}

impl ConnectionState {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            database: config.database_id,
            database_count: None,
            client_name: config.client_name.clone(),
            credentials: config.credentials.clone(),
            protocol: config.protocol,
            closed: false,
        }
    }

    pub fn database(&self) -> u32 {
        self.database
    }

    /// Number of databases the server advertised, if it told us.
    pub fn database_count(&self) -> Option<u32> {
        self.database_count
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn credentials(&self) -> Option<&ServerCredentials> {
        self.credentials.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_database_count(&mut self, count: u32) {
        self.database_count = Some(count);
    }

    /// Closing never reverts.
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Database(db) => self.database = db,
            StateUpdate::ClientName(name) => self.client_name = name,
            StateUpdate::Password(password) => {
                let username = self.credentials.take().and_then(|c| c.username);
                self.credentials = Some(ServerCredentials { username, password });
            }
        }
    }

    /// SELECT plus the state change it causes. Rejected locally when the
    /// index cannot name a database on this server.
    pub fn select_database(&self, index: i64) -> Result<(Cmd, StateUpdate)> {
        if index < 0 {
            return Err(Error::request(format!(
                "ERR DB index is out of range: {index}"
            )));
        }
        if let Some(count) = self.database_count {
            if index >= count as i64 {
                return Err(Error::request(format!(
                    "ERR DB index is out of range: {index} (server has {count} databases)"
                )));
            }
        }
        let db = u32::try_from(index)
            .map_err(|_| Error::request(format!("ERR DB index is out of range: {index}")))?;
        Ok((cmd("SELECT").arg(db), StateUpdate::Database(db)))
    }

    pub fn set_client_name(&self, name: &str) -> Result<(Cmd, StateUpdate)> {
        Ok((
            cmd("CLIENT").arg("SETNAME").arg(name),
            StateUpdate::ClientName((!name.is_empty()).then(|| name.to_string())),
        ))
    }

    /// With `re_authenticate_immediately` the new password is tried with AUTH
    /// right away; otherwise it is only stored for the next reconnect.
    pub fn update_connection_password(
        &self,
        password: &str,
        re_authenticate_immediately: bool,
    ) -> Result<(Option<Cmd>, StateUpdate)> {
        if password.is_empty() {
            return Err(Error::request("ERR password must not be empty"));
        }
        let auth = re_authenticate_immediately.then(|| self.auth_command(password));
        Ok((auth, StateUpdate::Password(password.to_string())))
    }

    fn auth_command(&self, password: &str) -> Cmd {
        let username = self.credentials.as_ref().and_then(|c| c.username.as_deref());
        match username {
            Some(user) => cmd("AUTH").arg(user).arg(password),
            None => cmd("AUTH").arg(password),
        }
    }

    /// Commands that restore this state on a fresh socket, in order.
    pub fn handshake(&self) -> Vec<Cmd> {
        let mut commands = Vec::new();

        match self.protocol {
            ProtocolVersion::Resp3 => {
                let mut hello = cmd("HELLO").arg("3");
                if let Some(creds) = &self.credentials {
                    hello = hello
                        .arg("AUTH")
                        .arg(creds.username.as_deref().unwrap_or("default"))
                        .arg(&creds.password);
                }
                if let Some(name) = &self.client_name {
                    hello = hello.arg("SETNAME").arg(name);
                }
                commands.push(hello);
            }
            ProtocolVersion::Resp2 => {
                if let Some(creds) = &self.credentials {
                    commands.push(self.auth_command(&creds.password));
                }
                if let Some(name) = &self.client_name {
                    commands.push(cmd("CLIENT").arg("SETNAME").arg(name));
                }
            }
        }

        if self.database != 0 {
            commands.push(cmd("SELECT").arg(self.database));
        }
        commands
    }
}

/// State change a raw command implies once the server accepts it, so a
/// SELECT or CLIENT SETNAME sent as a plain command keeps the state in step
/// with the server. Arguments are not validated here; the server judges them.
pub(crate) fn implied_update(command: &Cmd) -> Option<StateUpdate> {
    if command.db().is_some() {
        return None;
    }
    let name = command.name();
    let args = command.arg_slice();

    if name.eq_ignore_ascii_case(b"SELECT") {
        let [index] = args else {
            return None;
        };
        let db = std::str::from_utf8(index).ok()?.parse().ok()?;
        return Some(StateUpdate::Database(db));
    }
    if name.eq_ignore_ascii_case(b"CLIENT") {
        if let [sub, client_name] = args {
            if sub.eq_ignore_ascii_case(b"SETNAME") {
                let client_name = std::str::from_utf8(client_name).ok()?;
                return Some(StateUpdate::ClientName(
                    (!client_name.is_empty()).then(|| client_name.to_string()),
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConnectionState {
        ConnectionState::from_config(&ClientConfig::new())
    }

    #[test]
    fn test_select_rejects_negative_index() {
        let state = state();
        assert!(state.select_database(-1).unwrap_err().is_request());
    }

    #[test]
    fn test_select_rejects_index_past_database_count() {
        let mut state = state();
        state.set_database_count(16);
        let before = state.clone();

        assert!(state.select_database(16).unwrap_err().is_request());
        assert!(state.select_database(1000).unwrap_err().is_request());
        assert_eq!(state, before);

        let (select, update) = state.select_database(15).unwrap();
        assert_eq!(select, cmd("SELECT").arg("15"));
        assert_eq!(update, StateUpdate::Database(15));
    }

    #[test]
    fn test_select_without_known_count_defers_to_server() {
        assert!(state().select_database(1000).is_ok());
    }

    #[test]
    fn test_empty_password_is_rejected() {
        let state = state();
        assert!(state.update_connection_password("", true).unwrap_err().is_request());
        assert!(state.update_connection_password("", false).unwrap_err().is_request());
    }

    #[test]
    fn test_password_update_keeps_username() {
        let mut state = ConnectionState::from_config(
            &ClientConfig::new().with_credentials(Some("alice".into()), "old"),
        );
        let (auth, update) = state.update_connection_password("new", true).unwrap();
        assert_eq!(auth, Some(cmd("AUTH").arg("alice").arg("new")));

        state.apply(update);
        let creds = state.credentials().unwrap();
        assert_eq!(creds.username.as_deref(), Some("alice"));
        assert_eq!(creds.password, "new");
    }

    #[test]
    fn test_lazy_password_update_sends_nothing() {
        let (auth, _) = state().update_connection_password("pwd", false).unwrap();
        assert!(auth.is_none());
    }

    #[test]
    fn test_resp2_handshake() {
        let config = ClientConfig::new()
            .with_credentials(None, "pwd")
            .with_client_name("worker")
            .with_database_id(4);
        let handshake = ConnectionState::from_config(&config).handshake();
        assert_eq!(
            handshake,
            vec![
                cmd("AUTH").arg("pwd"),
                cmd("CLIENT").arg("SETNAME").arg("worker"),
                cmd("SELECT").arg("4"),
            ]
        );
    }

    #[test]
    fn test_resp3_handshake_folds_auth_and_name_into_hello() {
        let config = ClientConfig::new()
            .with_protocol(ProtocolVersion::Resp3)
            .with_credentials(None, "pwd")
            .with_client_name("worker");
        let handshake = ConnectionState::from_config(&config).handshake();
        assert_eq!(
            handshake,
            vec![cmd("HELLO")
                .arg("3")
                .arg("AUTH")
                .arg("default")
                .arg("pwd")
                .arg("SETNAME")
                .arg("worker")]
        );
    }

    #[test]
    fn test_default_handshake_is_empty() {
        assert!(state().handshake().is_empty());
    }

    #[test]
    fn test_closed_is_sticky() {
        let mut state = state();
        state.mark_closed();
        state.apply(StateUpdate::Database(3));
        assert!(state.is_closed());
    }

    #[test]
    fn test_raw_select_implies_database_update() {
        assert_eq!(
            implied_update(&cmd("select").arg("1")),
            Some(StateUpdate::Database(1))
        );
        assert_eq!(implied_update(&cmd("SELECT").arg("-1")), None);
        assert_eq!(implied_update(&cmd("SELECT").arg("one")), None);
        assert_eq!(implied_update(&cmd("SELECT").arg(1).arg(2)), None);
        assert_eq!(implied_update(&cmd("SELECT").arg(1).in_db(2)), None);
        assert_eq!(implied_update(&cmd("GET").arg("SELECT")), None);
    }

    #[test]
    fn test_raw_setname_implies_name_update() {
        assert_eq!(
            implied_update(&cmd("CLIENT").arg("setname").arg("worker")),
            Some(StateUpdate::ClientName(Some("worker".into())))
        );
        assert_eq!(
            implied_update(&cmd("CLIENT").arg("SETNAME").arg("")),
            Some(StateUpdate::ClientName(None))
        );
        assert_eq!(implied_update(&cmd("CLIENT").arg("GETNAME")), None);
    }
}
