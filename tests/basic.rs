mod common;

use cinder::command::CommandTable;
use cinder::protocol::cmd_line;
use cinder::*;
use common::TestConn;

fn exec(db: &StandaloneDatabase, conn: &mut TestConn, parts: &[&str]) -> Reply {
    db.exec(conn, &cmd_line(parts))
}

#[test]
fn set_get_del_cycle() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    assert_eq!(exec(&db, &mut c, &["SET", "a", "1"]).to_bytes(), &b"+OK\r\n"[..]);
    assert_eq!(exec(&db, &mut c, &["GET", "a"]).to_bytes(), &b"$1\r\n1\r\n"[..]);
    assert_eq!(exec(&db, &mut c, &["DEL", "a", "missing"]), Reply::Integer(1));
    assert_eq!(exec(&db, &mut c, &["GET", "a"]).to_bytes(), &b"$-1\r\n"[..]);
}

#[test]
fn rename_exists_type() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    exec(&db, &mut c, &["SET", "x", "41"]);
    assert_eq!(exec(&db, &mut c, &["EXISTS", "x", "x", "y"]), Reply::Integer(2));
    assert_eq!(exec(&db, &mut c, &["TYPE", "x"]), Reply::Status("string".into()));
    assert_eq!(exec(&db, &mut c, &["RENAME", "x", "y"]), Reply::Ok);
    assert_eq!(exec(&db, &mut c, &["TYPE", "x"]), Reply::Status("none".into()));
    assert_eq!(exec(&db, &mut c, &["GET", "y"]), Reply::bulk("41"));
    assert_eq!(exec(&db, &mut c, &["RENAME", "x", "z"]), Reply::error("ERR no such key"));

    exec(&db, &mut c, &["SET", "z", "0"]);
    assert_eq!(exec(&db, &mut c, &["RENAMENX", "y", "z"]), Reply::Integer(0));
    assert_eq!(exec(&db, &mut c, &["RENAMENX", "y", "w"]), Reply::Integer(1));
}

#[test]
fn string_commands() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    assert_eq!(exec(&db, &mut c, &["SETNX", "k", "v1"]), Reply::Integer(1));
    assert_eq!(exec(&db, &mut c, &["SETNX", "k", "v2"]), Reply::Integer(0));
    assert_eq!(exec(&db, &mut c, &["GETSET", "k", "value"]), Reply::bulk("v1"));
    assert_eq!(exec(&db, &mut c, &["STRLEN", "k"]), Reply::Integer(5));
    assert_eq!(exec(&db, &mut c, &["STRLEN", "nope"]), Reply::Integer(0));
    assert_eq!(exec(&db, &mut c, &["PING"]), Reply::Pong);
    assert_eq!(exec(&db, &mut c, &["PING", "hi"]), Reply::bulk("hi"));
}

#[test]
fn keys_and_flushdb() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    for k in ["user:1", "user:2", "order:1"] {
        exec(&db, &mut c, &["SET", k, "v"]);
    }
    match exec(&db, &mut c, &["KEYS", "user:*"]) {
        Reply::MultiBulk(mut keys) => {
            keys.sort();
            assert_eq!(keys, vec![Some("user:1".into()), Some("user:2".into())]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(exec(&db, &mut c, &["FLUSHDB"]), Reply::Ok);
    assert_eq!(exec(&db, &mut c, &["KEYS", "*"]), Reply::EmptyArray);
}

#[test]
fn keys_with_huge_key_and_many_stars() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    let huge = "h".repeat(1 << 20);
    let repeated = "a".repeat(60);
    exec(&db, &mut c, &["SET", &huge, "v"]);
    exec(&db, &mut c, &["SET", &repeated, "v"]);

    assert_eq!(
        exec(&db, &mut c, &["KEYS", "h*"]),
        Reply::multi_bulk(cmd_line(&[huge.as_str()]))
    );
    assert_eq!(exec(&db, &mut c, &["KEYS", "*a*a*a*a*a*a*a*a*b"]), Reply::EmptyArray);
    assert_eq!(
        exec(&db, &mut c, &["KEYS", "*a*a*a*a*a*a*a*a*"]),
        Reply::multi_bulk(cmd_line(&[repeated.as_str()]))
    );
}

#[test]
fn databases_are_isolated() {
    let db = StandaloneDatabase::in_memory(4);
    let mut c = TestConn::default();
    exec(&db, &mut c, &["SET", "k", "zero"]);
    assert_eq!(exec(&db, &mut c, &["SELECT", "3"]), Reply::Ok);
    assert_eq!(c.db, 3);
    assert_eq!(exec(&db, &mut c, &["GET", "k"]), Reply::null());
    assert_eq!(exec(&db, &mut c, &["SELECT", "4"]), Reply::error("ERR DB index is out of range"));
    assert_eq!(exec(&db, &mut c, &["SELECT", "x"]), Reply::error("ERR invalid DB index"));
    assert_eq!(exec(&db, &mut c, &["SELECT"]), Reply::arg_num_error("select"));
    assert_eq!(c.db, 3);
}

#[test]
fn arity_and_unknown_commands() {
    let db = StandaloneDatabase::in_memory(16);
    let mut c = TestConn::default();
    assert_eq!(exec(&db, &mut c, &["SET", "k"]), Reply::arg_num_error("set"));
    assert_eq!(exec(&db, &mut c, &["SET", "k", "v", "x"]), Reply::arg_num_error("set"));
    assert_eq!(exec(&db, &mut c, &["DEL"]), Reply::arg_num_error("del"));
    assert_eq!(exec(&db, &mut c, &["DEL", "a", "b", "c"]), Reply::Integer(0));
    assert_eq!(
        exec(&db, &mut c, &["FROB", "k"]),
        Reply::error("ERR unknown command 'frob'")
    );
}

#[test]
fn panicking_command_does_not_take_the_node_down() {
    let mut table = CommandTable::builtin();
    table.register("boom", |_, _| panic!("deliberate"), 1);
    let db = StandaloneDatabase::with_table(16, table);
    let mut c = TestConn::default();

    assert_eq!(exec(&db, &mut c, &["BOOM"]), Reply::error("ERR unknown"));
    assert_eq!(exec(&db, &mut c, &["SET", "after", "1"]), Reply::Ok);
    assert_eq!(exec(&db, &mut c, &["GET", "after"]), Reply::bulk("1"));
}
