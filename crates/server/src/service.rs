//! The Sinew query service: TissQL in, rendered rows out.
//!
//! One service instance serves one connection, carrying that connection's
//! open transaction. `BEGIN`/`COMMIT`/`ROLLBACK` map onto the storage
//! transaction manager; everything else goes through the parser and
//! executor. Rows render as JSON lines; empty results render as `OK`.

use std::sync::Arc;

use log::debug;
use tissdb_model::{Document, Value};
use tissdb_sinew::{server::QueryHandler, Param, Request};
use tissdb_sql::{parse, Executor};
use tissdb_storage::{Database, TxnId};

pub struct QueryService {
    db: Arc<Database>,
    txn: Option<TxnId>,
}

impl QueryService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, txn: None }
    }

    fn execute(&mut self, query: &str, params: &[Param]) -> Result<String, String> {
        match query.trim().to_ascii_uppercase().as_str() {
            "BEGIN" => {
                if self.txn.is_some() {
                    return Err("transaction already open".to_owned());
                }
                self.txn = Some(self.db.begin_transaction());
                return Ok("OK".to_owned());
            }
            "COMMIT" => {
                let txn = self.txn.take().ok_or("no open transaction")?;
                return match self.db.commit_transaction(txn) {
                    Ok(()) => Ok("OK".to_owned()),
                    Err(err) => Err(err.to_string()),
                };
            }
            "ROLLBACK" => {
                let txn = self.txn.take().ok_or("no open transaction")?;
                self.db.rollback_transaction(txn);
                return Ok("OK".to_owned());
            }
            _ => {}
        }

        let statement = parse(query).map_err(|e| e.to_string())?;
        let values: Vec<Value> = params.iter().map(param_to_value).collect();
        let rows = Executor::new(&self.db)
            .execute_in(&statement, &values, self.txn)
            .map_err(|e| e.to_string())?;
        Ok(render_rows(&rows))
    }
}

impl QueryHandler for QueryService {
    fn handle(&mut self, request: Request) -> Result<String, String> {
        debug!("query: {}", request.query);
        self.execute(&request.query, &request.params)
    }
}

impl Drop for QueryService {
    fn drop(&mut self) {
        // The connection went away with a transaction open: roll it back.
        if let Some(txn) = self.txn.take() {
            self.db.rollback_transaction(txn);
        }
    }
}

fn param_to_value(param: &Param) -> Value {
    match param {
        Param::Null => Value::Null,
        Param::Str(s) => Value::String(s.clone()),
        Param::Int(i) => Value::Number(*i as f64),
        Param::Float(f) => Value::Number(*f),
        Param::Bool(b) => Value::Bool(*b),
    }
}

fn render_rows(rows: &[Document]) -> String {
    if rows.is_empty() {
        return "OK".to_owned();
    }
    rows.iter()
        .map(|row| doc_to_json(row).to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn doc_to_json(doc: &Document) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert("_id".to_owned(), serde_json::Value::String(doc.id.clone()));
    for element in &doc.elements {
        object.insert(element.key.clone(), value_to_json(&element.value));
    }
    serde_json::Value::Object(object)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Timestamp(ts) => serde_json::Value::Number(ts.as_micros().into()),
        Value::Bytes(bytes) => serde_json::Value::String(
            bytes.iter().map(|b| format!("{b:02x}")).collect::<String>(),
        ),
        Value::Elements(elements) => {
            let mut object = serde_json::Map::new();
            for element in elements {
                object.insert(element.key.clone(), value_to_json(&element.value));
            }
            serde_json::Value::Object(object)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tissdb_storage::CollectionOptions;

    fn service() -> (tempfile::TempDir, QueryService) {
        let dir = tempfile::tempdir().unwrap();
        let db =
            Arc::new(Database::open("app", dir.path(), CollectionOptions::default()).unwrap());
        db.create_collection("users", None).unwrap();
        (dir, QueryService::new(db))
    }

    fn handle(service: &mut QueryService, query: &str) -> Result<String, String> {
        service.handle(Request {
            query: query.to_owned(),
            params: Vec::new(),
        })
    }

    #[test]
    fn insert_select_renders_json_lines() {
        let (_dir, mut service) = service();
        let reply =
            handle(&mut service, "INSERT INTO users (id, name) VALUES ('u1', 'ada')").unwrap();
        assert_eq!(reply, "OK");

        let reply = handle(&mut service, "SELECT * FROM users").unwrap();
        let row: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(row["name"], "ada");

        let err = handle(&mut service, "SELEC oops").unwrap_err();
        assert!(err.contains("parse error"), "{err}");
    }

    #[test]
    fn typed_params_reach_the_executor() {
        let (_dir, mut service) = service();
        handle(&mut service, "INSERT INTO users (id, age) VALUES ('u1', 41)").unwrap();
        handle(&mut service, "INSERT INTO users (id, age) VALUES ('u2', 12)").unwrap();

        let reply = service
            .handle(Request {
                query: "SELECT id FROM users WHERE age > ?".to_owned(),
                params: vec![Param::Int(18)],
            })
            .unwrap();
        let row: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(row["id"], "u1");
    }

    #[test]
    fn begin_commit_rollback_lifecycle() {
        let (_dir, mut service) = service();
        assert_eq!(handle(&mut service, "BEGIN").unwrap(), "OK");
        assert!(handle(&mut service, "BEGIN").is_err(), "nested BEGIN");

        handle(&mut service, "INSERT INTO users (id) VALUES ('staged')").unwrap();
        // Invisible until commit.
        assert_eq!(handle(&mut service, "SELECT * FROM users").unwrap(), "OK");
        assert_eq!(handle(&mut service, "COMMIT").unwrap(), "OK");
        assert_ne!(handle(&mut service, "SELECT * FROM users").unwrap(), "OK");

        assert!(handle(&mut service, "COMMIT").is_err(), "no open transaction");

        assert_eq!(handle(&mut service, "begin").unwrap(), "OK", "case-insensitive");
        handle(&mut service, "DELETE FROM users").unwrap();
        assert_eq!(handle(&mut service, "ROLLBACK").unwrap(), "OK");
        assert_ne!(handle(&mut service, "SELECT * FROM users").unwrap(), "OK");
    }

    #[test]
    fn dropping_service_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let db =
            Arc::new(Database::open("app", dir.path(), CollectionOptions::default()).unwrap());
        db.create_collection("users", None).unwrap();

        {
            let mut service = QueryService::new(db.clone());
            handle(&mut service, "BEGIN").unwrap();
            handle(&mut service, "INSERT INTO users (id) VALUES ('ghost')").unwrap();
        }
        assert!(db.scan("users").unwrap().is_empty());
    }
}
