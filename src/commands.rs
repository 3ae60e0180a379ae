/*!
 * Built-in Commands
 *
 * Key-space and string commands executed against one logical database.
 * Handlers receive the arguments without the command name; arity has already
 * been checked by the caller. Every handler that mutates state appends the
 * command to the AOF through `Db::add_aof`.
 */

use crate::command::CommandTable;
use crate::database::Db;
use crate::protocol::{cmd_line_with, Reply};
use bytes::Bytes;

/// Register every built-in command into `table`
pub fn register_builtin(table: &mut CommandTable) {
    table.register("ping", exec_ping, -1);

    table.register("get", exec_get, 2);
    table.register("set", exec_set, 3);
    table.register("setnx", exec_setnx, 3);
    table.register("getset", exec_getset, 3);
    table.register("strlen", exec_strlen, 2);

    table.register("del", exec_del, -2);
    table.register("exists", exec_exists, -2);
    table.register("keys", exec_keys, 2);
    table.register("flushdb", exec_flushdb, -1);
    table.register("type", exec_type, 2);
    table.register("rename", exec_rename, 3);
    table.register("renamenx", exec_renamenx, 3);
}

// PING [message]
fn exec_ping(_db: &Db, args: &[Bytes]) -> Reply {
    match args {
        [] => Reply::Pong,
        [msg] => Reply::bulk(msg.clone()),
        _ => Reply::arg_num_error("ping"),
    }
}

//
// Strings
//

fn exec_get(db: &Db, args: &[Bytes]) -> Reply {
    Reply::Bulk(db.data().get(&args[0]))
}

fn exec_set(db: &Db, args: &[Bytes]) -> Reply {
    let _order = db.single_key_write();
    db.data().put_with(args[0].clone(), args[1].clone(), || {
        db.add_aof(cmd_line_with("set", args));
    });
    Reply::Ok
}

fn exec_setnx(db: &Db, args: &[Bytes]) -> Reply {
    let _order = db.single_key_write();
    let inserted = db.data().put_if_absent(args[0].clone(), args[1].clone(), || {
        db.add_aof(cmd_line_with("setnx", args));
    });
    Reply::Integer(inserted)
}

fn exec_getset(db: &Db, args: &[Bytes]) -> Reply {
    let _order = db.single_key_write();
    let old = db.data().swap(args[0].clone(), args[1].clone(), || {
        db.add_aof(cmd_line_with("getset", args));
    });
    Reply::Bulk(old)
}

fn exec_strlen(db: &Db, args: &[Bytes]) -> Reply {
    let len = db.data().get(&args[0]).map_or(0, |v| v.len());
    Reply::Integer(len as i64)
}

//
// Key space
//

// DEL k1 k2 ... logs one `DEL k` per key actually removed
fn exec_del(db: &Db, args: &[Bytes]) -> Reply {
    let _order = db.single_key_write();
    let deleted = args
        .iter()
        .filter(|k| {
            db.data()
                .remove_with(k, || db.add_aof(cmd_line_with("del", std::slice::from_ref(*k))))
                .is_some()
        })
        .count() as i64;
    Reply::Integer(deleted)
}

// EXISTS k1 k2 ... counts duplicates, like Redis
fn exec_exists(db: &Db, args: &[Bytes]) -> Reply {
    let n = args.iter().filter(|k| db.data().contains(k)).count();
    Reply::Integer(n as i64)
}

fn exec_keys(db: &Db, args: &[Bytes]) -> Reply {
    let pattern = &args[0];
    let matched: Vec<Bytes> = db
        .data()
        .keys()
        .into_iter()
        .filter(|k| glob_match(pattern, k))
        .collect();
    if matched.is_empty() {
        return Reply::EmptyArray;
    }
    Reply::multi_bulk(matched)
}

fn exec_flushdb(db: &Db, args: &[Bytes]) -> Reply {
    let _order = db.multi_key_write();
    db.data().clear();
    db.add_aof(cmd_line_with("flushdb", args));
    Reply::Ok
}

fn exec_type(db: &Db, args: &[Bytes]) -> Reply {
    if db.data().contains(&args[0]) {
        Reply::Status("string".into())
    } else {
        Reply::Status("none".into())
    }
}

fn exec_rename(db: &Db, args: &[Bytes]) -> Reply {
    let (src, dest) = (&args[0], &args[1]);
    let _order = db.multi_key_write();
    let Some(value) = db.data().remove(src) else {
        return Reply::error("ERR no such key");
    };
    db.data().put(dest.clone(), value);
    db.add_aof(cmd_line_with("rename", args));
    Reply::Ok
}

fn exec_renamenx(db: &Db, args: &[Bytes]) -> Reply {
    let (src, dest) = (&args[0], &args[1]);
    let _order = db.multi_key_write();
    if db.data().contains(dest) {
        return Reply::Integer(0);
    }
    let Some(value) = db.data().remove(src) else {
        return Reply::error("ERR no such key");
    };
    db.data().put(dest.clone(), value);
    db.add_aof(cmd_line_with("renamenx", args));
    Reply::Integer(1)
}

/// Redis-style glob: `*`, `?`, `[abc]`, `[a-z]`, `[^x]`, and `\\` escapes
///
/// Iterative, with a single backtrack point at the last `*` seen, so time is
/// bounded by `pattern.len() * text.len()` and stack use is constant.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // (pattern index after the last `*`, text index it is currently matched up to)
    let mut star: Option<(usize, usize)> = None;

    loop {
        if p < pattern.len() && pattern[p] == b'*' {
            p += 1;
            star = Some((p, t));
            continue;
        }
        if t == text.len() {
            break;
        }
        if let Some(next) = match_one(pattern, p, text[t]) {
            p = next;
            t += 1;
            continue;
        }
        // let the last `*` swallow one more byte and retry
        match star {
            Some((after_star, matched_to)) => {
                p = after_star;
                t = matched_to + 1;
                star = Some((after_star, t));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

/// Match the single-byte token at `pattern[p]` against `ch`, returning the
/// index of the next token
fn match_one(pattern: &[u8], p: usize, ch: u8) -> Option<usize> {
    let token = *pattern.get(p)?;
    let next = match token {
        b'?' => p + 1,
        b'\\' if p + 1 < pattern.len() => {
            if pattern[p + 1] != ch {
                return None;
            }
            p + 2
        }
        b'[' => match pattern[p + 1..].iter().position(|&b| b == b']') {
            // unterminated class is a literal `[`
            None if ch == b'[' => p + 1,
            None => return None,
            Some(len) => {
                if !class_match(&pattern[p + 1..p + 1 + len], ch) {
                    return None;
                }
                p + len + 2
            }
        },
        c if c == ch => p + 1,
        _ => return None,
    };
    Some(next)
}

fn class_match(class: &[u8], ch: u8) -> bool {
    let (negate, class) = match class {
        [b'^', rest @ ..] => (true, rest),
        _ => (false, class),
    };
    let mut matched = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == b'-' {
            let (lo, hi) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            matched |= (lo..=hi).contains(&ch);
            i += 3;
        } else {
            matched |= class[i] == ch;
            i += 1;
        }
    }
    matched != negate
}
