use std::collections::HashMap;

use log::debug;

use crate::{
    cmd::{cmd, Cmd, ToArg},
    config::ClientConfig,
    connection::ConnectionState,
    dispatcher::Dispatcher,
    error::{Error, Result},
    options::{FlushMode, InfoSection, LolwutOptions, ScanOptions, SortOptions},
    resp::Reply,
};

/// Typed command surface over a [`Dispatcher`].
///
/// Argument shape is checked before anything is sent; what the server thinks
/// of the arguments comes back as [`Error::Request`].
#[derive(Debug, Clone)]
pub struct Client {
    dispatcher: Dispatcher,
}

fn unexpected(expected: &'static str, reply: &Reply) -> Error {
    Error::UnexpectedReply {
        expected,
        got: reply.kind_name().to_string(),
    }
}

fn expect_string(reply: Reply) -> Result<String> {
    match reply {
        Reply::SimpleString(_) | Reply::BulkString(_) => {
            let got = unexpected("UTF-8 string", &reply);
            reply.into_string().ok_or(got)
        }
        other => Err(unexpected("string", &other)),
    }
}

fn expect_optional_string(reply: Reply) -> Result<Option<String>> {
    match reply {
        Reply::Nil => Ok(None),
        reply => expect_string(reply).map(Some),
    }
}

fn expect_int(reply: Reply) -> Result<i64> {
    reply.as_int().ok_or_else(|| unexpected("integer", &reply))
}

fn expect_bool(reply: Reply) -> Result<bool> {
    reply.as_bool().ok_or_else(|| unexpected("boolean", &reply))
}

fn expect_array(reply: Reply) -> Result<Vec<Reply>> {
    match reply {
        Reply::Array(items) => Ok(items),
        other => Err(unexpected("array", &other)),
    }
}

fn expect_string_map(reply: Reply) -> Result<HashMap<String, String>> {
    let kind = reply.kind_name().to_string();
    let map = reply.into_map().ok_or(Error::UnexpectedReply {
        expected: "map",
        got: kind,
    })?;
    map.into_iter()
        .map(|(key, value)| Ok((expect_string(key)?, expect_string(value)?)))
        .collect()
}

/// Flattens key/value pairs into an argument list, refusing an empty mapping.
fn pairs_to_args<K: ToArg, V: ToArg>(
    command: &str,
    pairs: impl IntoIterator<Item = (K, V)>,
) -> Result<Vec<bytes::Bytes>> {
    let args: Vec<_> = pairs
        .into_iter()
        .flat_map(|(key, value)| [key.to_arg(), value.to_arg()])
        .collect();
    if args.is_empty() {
        return Err(Error::request(format!(
            "ERR wrong number of arguments for '{command}' command: empty mapping"
        )));
    }
    Ok(args)
}

fn non_empty<T>(command: &str, what: &str, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Err(Error::request(format!(
            "ERR wrong number of arguments for '{command}' command: no {what} given"
        )));
    }
    Ok(())
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let dispatcher = Dispatcher::connect(config).await?;
        Ok(Self { dispatcher })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.dispatcher.connection_state()
    }

    /// Closes the client. Every later call fails with [`Error::Closing`].
    pub fn close(&self) {
        self.dispatcher.close();
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Sends a prepared command as is.
    pub async fn send_command(&self, command: Cmd) -> Result<Reply> {
        self.dispatcher.send(command).await
    }

    /// Runs any command the server understands, verb first:
    ///
    /// ```no_run
    /// # async fn demo(client: resp_client::Client) -> resp_client::Result<()> {
    /// let reply = client.custom_command(&["CLIENT", "INFO"]).await?;
    /// println!("{}", reply.as_str().unwrap_or_default());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Nothing about the command is checked locally beyond it having a verb.
    pub async fn custom_command<T: ToArg>(&self, args: &[T]) -> Result<Reply> {
        let command = Cmd::from_args(args)?;
        self.dispatcher.send(command).await
    }

    /// `None` when the key does not exist, as opposed to `Some("")`.
    pub async fn get(&self, key: impl ToArg) -> Result<Option<String>> {
        expect_optional_string(self.dispatcher.send(cmd("GET").arg(key)).await?)
    }

    pub async fn set(&self, key: impl ToArg, value: impl ToArg) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("SET").arg(key).arg(value)).await?)
    }

    pub async fn mget<K: ToArg>(&self, keys: &[K]) -> Result<Vec<Option<String>>> {
        non_empty("mget", "keys", keys)?;
        let reply = self.dispatcher.send(cmd("MGET").args(keys)).await?;
        expect_array(reply)?
            .into_iter()
            .map(expect_optional_string)
            .collect()
    }

    pub async fn mset<K: ToArg, V: ToArg>(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<String> {
        let args = pairs_to_args("mset", pairs)?;
        expect_string(self.dispatcher.send(cmd("MSET").args(args)).await?)
    }

    pub async fn del<K: ToArg>(&self, keys: &[K]) -> Result<i64> {
        non_empty("del", "keys", keys)?;
        expect_int(self.dispatcher.send(cmd("DEL").args(keys)).await?)
    }

    pub async fn lpush<E: ToArg>(&self, key: impl ToArg, elements: &[E]) -> Result<i64> {
        non_empty("lpush", "elements", elements)?;
        expect_int(self.dispatcher.send(cmd("LPUSH").arg(key).args(elements)).await?)
    }

    pub async fn sadd<M: ToArg>(&self, key: impl ToArg, members: &[M]) -> Result<i64> {
        non_empty("sadd", "members", members)?;
        expect_int(self.dispatcher.send(cmd("SADD").arg(key).args(members)).await?)
    }

    pub async fn hset<F: ToArg, V: ToArg>(
        &self,
        key: impl ToArg,
        field_values: impl IntoIterator<Item = (F, V)>,
    ) -> Result<i64> {
        let args = pairs_to_args("hset", field_values)?;
        expect_int(self.dispatcher.send(cmd("HSET").arg(key).args(args)).await?)
    }

    pub async fn ping(&self) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("PING")).await?)
    }

    pub async fn ping_with_message(&self, message: impl ToArg) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("PING").arg(message)).await?)
    }

    pub async fn echo(&self, message: impl ToArg) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("ECHO").arg(message)).await?)
    }

    pub async fn info(&self) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("INFO")).await?)
    }

    pub async fn info_sections(&self, sections: &[InfoSection]) -> Result<String> {
        let command = cmd("INFO").args(sections.iter().map(|s| s.as_str()));
        expect_string(self.dispatcher.send(command).await?)
    }

    /// Switches this connection's database. Only this connection is
    /// affected, and the change sticks across reconnects.
    pub async fn select(&self, index: i64) -> Result<String> {
        let (command, update) = self.connection_state().select_database(index)?;
        let reply = self
            .dispatcher
            .send_with_update(Some(command), update)
            .await?;
        expect_string(reply)
    }

    pub async fn config_get<P: ToArg>(&self, parameters: &[P]) -> Result<HashMap<String, String>> {
        non_empty("config|get", "parameters", parameters)?;
        let reply = self
            .dispatcher
            .send(cmd("CONFIG").arg("GET").args(parameters))
            .await?;
        expect_string_map(reply)
    }

    pub async fn config_set<K: ToArg, V: ToArg>(
        &self,
        parameters: impl IntoIterator<Item = (K, V)>,
    ) -> Result<String> {
        let args = pairs_to_args("config|set", parameters)?;
        expect_string(self.dispatcher.send(cmd("CONFIG").arg("SET").args(args)).await?)
    }

    pub async fn config_reset_stat(&self) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("CONFIG").arg("RESETSTAT")).await?)
    }

    pub async fn config_rewrite(&self) -> Result<String> {
        expect_string(self.dispatcher.send(cmd("CONFIG").arg("REWRITE")).await?)
    }

    pub async fn dbsize(&self) -> Result<i64> {
        expect_int(self.dispatcher.send(cmd("DBSIZE")).await?)
    }

    /// Server time as `[unix seconds, microseconds]`.
    pub async fn time(&self) -> Result<Vec<String>> {
        expect_array(self.dispatcher.send(cmd("TIME")).await?)?
            .into_iter()
            .map(expect_string)
            .collect()
    }

    pub async fn flushall(&self, mode: Option<FlushMode>) -> Result<String> {
        let command = cmd("FLUSHALL").args(mode.map(|m| m.as_str()));
        expect_string(self.dispatcher.send(command).await?)
    }

    pub async fn flushdb(&self, mode: Option<FlushMode>) -> Result<String> {
        let command = cmd("FLUSHDB").args(mode.map(|m| m.as_str()));
        expect_string(self.dispatcher.send(command).await?)
    }

    pub async fn client_id(&self) -> Result<i64> {
        expect_int(self.dispatcher.send(cmd("CLIENT").arg("ID")).await?)
    }

    pub async fn client_set_name(&self, name: &str) -> Result<String> {
        let (command, update) = self.connection_state().set_client_name(name)?;
        let reply = self
            .dispatcher
            .send_with_update(Some(command), update)
            .await?;
        expect_string(reply)
    }

    pub async fn client_get_name(&self) -> Result<Option<String>> {
        expect_optional_string(self.dispatcher.send(cmd("CLIENT").arg("GETNAME")).await?)
    }

    pub async fn last_save(&self) -> Result<i64> {
        expect_int(self.dispatcher.send(cmd("LASTSAVE")).await?)
    }

    pub async fn lolwut(&self, options: &LolwutOptions) -> Result<String> {
        let command = cmd("LOLWUT").args(options.to_args());
        expect_string(self.dispatcher.send(command).await?)
    }

    /// Moves `key` to database `db`; `false` when it was not moved.
    pub async fn move_key(&self, key: impl ToArg, db: i64) -> Result<bool> {
        expect_bool(self.dispatcher.send(cmd("MOVE").arg(key).arg(db)).await?)
    }

    /// One SCAN step. Returns the next cursor (`"0"` once the iteration is
    /// over) and the keys of this step.
    pub async fn scan(&self, cursor: impl ToArg, options: &ScanOptions) -> Result<(String, Vec<String>)> {
        let command = cmd("SCAN").arg(cursor).args(options.to_args());
        let reply = self.dispatcher.send(command).await?;
        let mut parts = expect_array(reply)?.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(cursor), Some(keys), None) => {
                let keys = expect_array(keys)?
                    .into_iter()
                    .map(expect_string)
                    .collect::<Result<Vec<_>>>()?;
                Ok((expect_string(cursor)?, keys))
            }
            _ => Err(Error::UnexpectedReply {
                expected: "[cursor, keys]",
                got: "array of another length".into(),
            }),
        }
    }

    pub async fn random_key(&self) -> Result<Option<String>> {
        expect_optional_string(self.dispatcher.send(cmd("RANDOMKEY")).await?)
    }

    pub async fn function_flush(&self, mode: Option<FlushMode>) -> Result<String> {
        let command = cmd("FUNCTION").arg("FLUSH").args(mode.map(|m| m.as_str()));
        expect_string(self.dispatcher.send(command).await?)
    }

    /// Loads a library and returns its name.
    pub async fn function_load(&self, code: &str, replace: bool) -> Result<String> {
        let mut command = cmd("FUNCTION").arg("LOAD");
        if replace {
            command = command.arg("REPLACE");
        }
        expect_string(self.dispatcher.send(command.arg(code)).await?)
    }

    pub async fn fcall<K: ToArg, A: ToArg>(&self, function: &str, keys: &[K], args: &[A]) -> Result<Reply> {
        self.dispatcher
            .send(cmd("FCALL").arg(function).arg(keys.len()).args(keys).args(args))
            .await
    }

    pub async fn fcall_ro<K: ToArg, A: ToArg>(&self, function: &str, keys: &[K], args: &[A]) -> Result<Reply> {
        self.dispatcher
            .send(cmd("FCALL_RO").arg(function).arg(keys.len()).args(keys).args(args))
            .await
    }

    /// `SORT_RO`; missing lookups (GET patterns that match nothing) are `None`.
    pub async fn sort_ro(&self, key: impl ToArg, options: &SortOptions) -> Result<Vec<Option<String>>> {
        let command = cmd("SORT_RO").arg(key).args(options.to_args());
        expect_array(self.dispatcher.send(command).await?)?
            .into_iter()
            .map(expect_optional_string)
            .collect()
    }

    /// Replaces the password used to authenticate this connection.
    ///
    /// With `re_authenticate_immediately`, AUTH is sent right away and the
    /// new password is only kept if the server accepts it; a rejection
    /// leaves the connection working under the old credentials. Otherwise
    /// the password is stored and used the next time the connection is
    /// re-established.
    pub async fn update_connection_password(
        &self,
        password: &str,
        re_authenticate_immediately: bool,
    ) -> Result<String> {
        let (auth, update) = self
            .connection_state()
            .update_connection_password(password, re_authenticate_immediately)?;
        debug!(
            "updating connection password (immediate: {re_authenticate_immediately})"
        );
        expect_string(self.dispatcher.send_with_update(auth, update).await?)
    }
}
