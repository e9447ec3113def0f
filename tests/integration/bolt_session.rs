//! Bolt 4.4 sessions driven over an in-memory duplex stream.

#![allow(missing_docs)]

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use engramdb::db::{Config, Database};
use engramdb::server::bolt::{self, request, response};
use engramdb::server::packstream::{self, PackValue};
use engramdb::server::{AllowAll, Authenticator, BasicAuth};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

struct Client {
    stream: DuplexStream,
    server: JoinHandle<()>,
}

impl Client {
    async fn connect(db: Database, auth: Arc<dyn Authenticator>) -> Self {
        let (mut stream, server_side) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            bolt::handle_connection(server_side, db, auth)
                .await
                .expect("connection");
        });
        let mut preamble = Vec::from(bolt::MAGIC);
        preamble.extend_from_slice(&[0, 0, 4, 4]);
        preamble.extend_from_slice(&[0; 12]);
        stream.write_all(&preamble).await.expect("handshake");
        let mut version = [0u8; 4];
        stream.read_exact(&mut version).await.expect("version");
        assert_eq!(version, [0, 0, 4, 4]);
        Self { stream, server }
    }

    async fn send(&mut self, tag: u8, fields: Vec<PackValue>) {
        let mut body = BytesMut::new();
        packstream::encode(&PackValue::Struct(tag, fields), &mut body);
        let mut out = BytesMut::new();
        out.put_u16(body.len() as u16);
        out.put_slice(&body);
        out.put_u16(0);
        self.stream.write_all(&out).await.expect("send");
    }

    async fn recv(&mut self) -> (u8, Vec<PackValue>) {
        let mut message = Vec::new();
        loop {
            let mut header = [0u8; 2];
            self.stream.read_exact(&mut header).await.expect("chunk header");
            let len = u16::from_be_bytes(header) as usize;
            if len == 0 {
                break;
            }
            let start = message.len();
            message.resize(start + len, 0);
            self.stream
                .read_exact(&mut message[start..])
                .await
                .expect("chunk body");
        }
        let mut input = message.as_slice();
        match packstream::decode(&mut input).expect("decode") {
            PackValue::Struct(tag, fields) => (tag, fields),
            other => panic!("expected a structure, got {other:?}"),
        }
    }

    async fn expect_success(&mut self) -> PackValue {
        let (tag, mut fields) = self.recv().await;
        assert_eq!(tag, response::SUCCESS, "fields: {fields:?}");
        fields.pop().unwrap_or(PackValue::Map(Vec::new()))
    }

    async fn hello(&mut self, extra: PackValue) -> PackValue {
        self.send(request::HELLO, vec![extra]).await;
        self.expect_success().await
    }

    async fn run(&mut self, query: &str, params: PackValue) -> PackValue {
        self.send(
            request::RUN,
            vec![PackValue::from(query), params, PackValue::Map(Vec::new())],
        )
        .await;
        self.expect_success().await
    }

    /// Pulls everything, returning the records and the final summary.
    async fn pull_all(&mut self) -> (Vec<Vec<PackValue>>, PackValue) {
        self.send(request::PULL, vec![PackValue::map([("n", PackValue::Int(-1))])])
            .await;
        let mut records = Vec::new();
        loop {
            let (tag, mut fields) = self.recv().await;
            match tag {
                response::RECORD => match fields.pop() {
                    Some(PackValue::List(values)) => records.push(values),
                    other => panic!("bad record {other:?}"),
                },
                response::SUCCESS => {
                    return (records, fields.pop().unwrap_or(PackValue::Map(Vec::new())))
                }
                other => panic!("unexpected message 0x{other:02X}: {fields:?}"),
            }
        }
    }

    async fn goodbye(mut self) {
        self.send(request::GOODBYE, Vec::new()).await;
        self.server.await.expect("server task");
    }
}

fn no_params() -> PackValue {
    PackValue::Map(Vec::new())
}

fn user_agent() -> PackValue {
    PackValue::map([("user_agent", PackValue::from("engramdb-tests/1.0"))])
}

fn db() -> Database {
    Database::open_in_memory(Config::default()).expect("open")
}

#[tokio::test]
async fn hello_run_pull_auto_commit() {
    let db = db();
    let mut client = Client::connect(db.clone(), Arc::new(AllowAll)).await;
    let hello = client.hello(user_agent()).await;
    assert!(hello
        .get("server")
        .and_then(PackValue::as_str)
        .is_some_and(|s| s.starts_with("EngramDB/")));

    let mut params = Vec::new();
    params.push(("name".to_string(), PackValue::from("Alice")));
    params.push(("age".to_string(), PackValue::Int(30)));
    let run = client
        .run(
            "CREATE (n:Person {name: $name, age: $age}) RETURN n.name AS name, n.age AS age",
            PackValue::Map(params),
        )
        .await;
    assert_eq!(
        run.get("fields"),
        Some(&PackValue::List(vec![PackValue::from("name"), PackValue::from("age")]))
    );

    let (records, summary) = client.pull_all().await;
    assert_eq!(
        records,
        vec![vec![PackValue::from("Alice"), PackValue::Int(30)]]
    );
    assert_eq!(summary.get("type").and_then(PackValue::as_str), Some("rw"));
    assert!(summary
        .get("bookmark")
        .and_then(PackValue::as_str)
        .is_some_and(|b| b.starts_with("engramdb:")));
    assert_eq!(
        summary
            .get("stats")
            .and_then(|s| s.get("nodes-created"))
            .and_then(PackValue::as_int),
        Some(1)
    );
    client.goodbye().await;

    let check = db
        .execute("MATCH (p:Person) RETURN count(p)", Default::default())
        .expect("count");
    assert_eq!(check.rows[0][0], engramdb::query::Value::Int(1));
}

#[tokio::test]
async fn pull_in_batches_reports_has_more() {
    let mut client = Client::connect(db(), Arc::new(AllowAll)).await;
    client.hello(user_agent()).await;
    client.run("UNWIND [1, 2, 3] AS x RETURN x", no_params()).await;

    client
        .send(request::PULL, vec![PackValue::map([("n", PackValue::Int(2))])])
        .await;
    for expected in [1, 2] {
        let (tag, fields) = client.recv().await;
        assert_eq!(tag, response::RECORD);
        assert_eq!(fields, vec![PackValue::List(vec![PackValue::Int(expected)])]);
    }
    let more = client.expect_success().await;
    assert_eq!(more.get("has_more"), Some(&PackValue::Bool(true)));

    let (records, summary) = client.pull_all().await;
    assert_eq!(records, vec![vec![PackValue::Int(3)]]);
    assert_eq!(summary.get("type").and_then(PackValue::as_str), Some("r"));
    client.goodbye().await;
}

#[tokio::test]
async fn explicit_transaction_commits_on_commit() {
    let db = db();
    let mut client = Client::connect(db.clone(), Arc::new(AllowAll)).await;
    client.hello(user_agent()).await;

    client.send(request::BEGIN, vec![no_params()]).await;
    client.expect_success().await;
    client
        .run("CREATE (:Memory {content: 'pending'})", no_params())
        .await;
    client.pull_all().await;

    let outside = db
        .execute("MATCH (m:Memory) RETURN count(m)", Default::default())
        .expect("count");
    assert_eq!(outside.rows[0][0], engramdb::query::Value::Int(0));

    client.send(request::COMMIT, Vec::new()).await;
    let committed = client.expect_success().await;
    assert!(committed.get("bookmark").is_some());

    let after = db
        .execute("MATCH (m:Memory) RETURN count(m)", Default::default())
        .expect("count");
    assert_eq!(after.rows[0][0], engramdb::query::Value::Int(1));
    client.goodbye().await;
}

#[tokio::test]
async fn rollback_discards_explicit_writes() {
    let db = db();
    let mut client = Client::connect(db.clone(), Arc::new(AllowAll)).await;
    client.hello(user_agent()).await;
    client.send(request::BEGIN, vec![no_params()]).await;
    client.expect_success().await;
    client.run("CREATE (:Draft)", no_params()).await;
    client.pull_all().await;
    client.send(request::ROLLBACK, Vec::new()).await;
    client.expect_success().await;
    client.goodbye().await;

    let result = db
        .execute("MATCH (d:Draft) RETURN count(d)", Default::default())
        .expect("count");
    assert_eq!(result.rows[0][0], engramdb::query::Value::Int(0));
}

#[tokio::test]
async fn failure_ignores_until_reset() {
    let mut client = Client::connect(db(), Arc::new(AllowAll)).await;
    client.hello(user_agent()).await;

    client
        .send(
            request::RUN,
            vec![PackValue::from("MATCH (n RETURN n"), no_params(), no_params()],
        )
        .await;
    let (tag, fields) = client.recv().await;
    assert_eq!(tag, response::FAILURE);
    assert_eq!(
        fields[0].get("code").and_then(PackValue::as_str),
        Some("Neo.ClientError.Statement.SyntaxError")
    );

    client
        .send(request::PULL, vec![PackValue::map([("n", PackValue::Int(-1))])])
        .await;
    let (tag, _) = client.recv().await;
    assert_eq!(tag, response::IGNORED);

    client.send(request::RESET, Vec::new()).await;
    client.expect_success().await;

    client.run("RETURN 1 AS one", no_params()).await;
    let (records, _) = client.pull_all().await;
    assert_eq!(records, vec![vec![PackValue::Int(1)]]);
    client.goodbye().await;
}

#[tokio::test]
async fn bad_credentials_close_the_connection() {
    let auth: Arc<dyn Authenticator> = Arc::new(BasicAuth::new("neo4j", "secret"));
    let mut client = Client::connect(db(), Arc::clone(&auth)).await;
    client
        .send(
            request::HELLO,
            vec![PackValue::map([
                ("scheme", PackValue::from("basic")),
                ("principal", PackValue::from("neo4j")),
                ("credentials", PackValue::from("wrong")),
            ])],
        )
        .await;
    let (tag, fields) = client.recv().await;
    assert_eq!(tag, response::FAILURE);
    assert_eq!(
        fields[0].get("code").and_then(PackValue::as_str),
        Some("Neo.ClientError.Security.Unauthorized")
    );
    client.server.await.expect("server closes");

    let mut ok = Client::connect(db(), auth).await;
    ok.hello(PackValue::map([
        ("scheme", PackValue::from("basic")),
        ("principal", PackValue::from("neo4j")),
        ("credentials", PackValue::from("secret")),
    ]))
    .await;
    ok.run("RETURN 'in' AS x", no_params()).await;
    let (records, _) = ok.pull_all().await;
    assert_eq!(records, vec![vec![PackValue::from("in")]]);
    ok.goodbye().await;
}

#[tokio::test]
async fn run_before_hello_is_rejected() {
    let mut client = Client::connect(db(), Arc::new(AllowAll)).await;
    client.send(request::RUN, vec![PackValue::from("RETURN 1"), no_params()]).await;
    let (tag, _) = client.recv().await;
    assert_eq!(tag, response::FAILURE);
    client.server.await.expect("server closes");
}
