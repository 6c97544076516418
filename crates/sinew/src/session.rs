//! Sessions and client-side transaction handles.

use std::{collections::BTreeMap, net::TcpStream, sync::Arc};

use log::warn;

use crate::{
    error::SinewError,
    pool::PoolInner,
    protocol::{self, Param, Reply, MAX_RESPONSE_SIZE},
};

/// One checked-out connection. Not thread-safe; the pool is.
#[derive(Debug)]
pub struct Session {
    stream: Option<TcpStream>,
    pool: Arc<PoolInner>,
}

impl Session {
    pub(crate) fn new(stream: TcpStream, pool: Arc<PoolInner>) -> Self {
        Self {
            stream: Some(stream),
            pool,
        }
    }

    /// Run a query with no parameters.
    pub fn run(&mut self, query: &str) -> Result<Reply, SinewError> {
        self.send_and_receive(&protocol::encode_plain(query))
    }

    /// Run a parameterized query over the typed binary framing. This is the
    /// supported way to get user data into a query.
    pub fn run_with_params(&mut self, query: &str, params: &[Param]) -> Result<Reply, SinewError> {
        let frame = protocol::encode_with_params(query, params)?;
        self.send_and_receive(&frame)
    }

    /// Splice `$name` placeholders into the query text client-side, longest
    /// names first, and run the result as plain text.
    #[deprecated(
        note = "string splicing cannot protect against injection; use run_with_params"
    )]
    pub fn run_with_client_side_substitution(
        &mut self,
        query: &str,
        params: &BTreeMap<String, Param>,
    ) -> Result<Reply, SinewError> {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

        let mut final_query = query.to_owned();
        for key in keys {
            let placeholder = format!("${key}");
            final_query = final_query.replace(&placeholder, &params[key].to_query_literal());
        }
        self.run(&final_query)
    }

    /// Run `BEGIN` and hand back a transaction guard tied to this session.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>, SinewError> {
        self.run("BEGIN")?;
        Ok(Transaction {
            session: self,
            active: true,
        })
    }

    fn send_and_receive(&mut self, frame: &[u8]) -> Result<Reply, SinewError> {
        use std::io::Write;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SinewError::Query("session has no live connection".to_owned()))?;

        if let Err(err) = stream.write_all(frame).and_then(|()| stream.flush()) {
            self.kill_connection();
            return Err(SinewError::Query(format!("send failed: {err}")));
        }

        match protocol::read_frame(stream, MAX_RESPONSE_SIZE) {
            Ok(Some(body)) => Ok(Reply::new(String::from_utf8_lossy(&body).into_owned())),
            Ok(None) => {
                self.kill_connection();
                Err(SinewError::Query("connection closed by server".to_owned()))
            }
            Err(err) => {
                self.kill_connection();
                Err(SinewError::Query(format!("receive failed: {err}")))
            }
        }
    }

    /// The connection is no longer trustworthy: close it and shrink the
    /// pool instead of returning it.
    fn kill_connection(&mut self) {
        if self.stream.take().is_some() {
            self.pool.discard();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.checkin(stream);
        }
    }
}

/// A client-side transaction. Commit or roll back exactly once; dropping an
/// active handle rolls back.
pub struct Transaction<'a> {
    session: &'a mut Session,
    active: bool,
}

impl Transaction<'_> {
    pub fn run(&mut self, query: &str) -> Result<Reply, SinewError> {
        self.check_active()?;
        self.session.run(query)
    }

    pub fn run_with_params(
        &mut self,
        query: &str,
        params: &[Param],
    ) -> Result<Reply, SinewError> {
        self.check_active()?;
        self.session.run_with_params(query, params)
    }

    pub fn commit(&mut self) -> Result<(), SinewError> {
        self.check_active()?;
        self.active = false;
        self.session.run("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), SinewError> {
        self.check_active()?;
        self.active = false;
        self.session.run("ROLLBACK")?;
        Ok(())
    }

    fn check_active(&self) -> Result<(), SinewError> {
        if self.active {
            Ok(())
        } else {
            Err(SinewError::TransactionInactive)
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(err) = self.session.run("ROLLBACK") {
                // Nothing useful to do from a destructor; the server rolls
                // back on disconnect anyway.
                warn!("auto-rollback failed: {err}");
            }
        }
    }
}
