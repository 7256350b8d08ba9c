//! In-memory RESP key-value store serving any number of connections.
//!
//! Nodes built from one [`FakeStore`] share its data, which stands in for
//! replication that has already happened. Each node keeps its own credential
//! gate and pub/sub registry.

use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use resp_harness::Response;
use resp_harness::resp::read_response;

/// A canned reply served instead of the real one, `times` times after `AUTH`.
pub struct Override {
    pub command: String,
    pub reply: Response,
    pub times: usize,
}

impl Override {
    pub fn always(command: &str, reply: Response) -> Self {
        Self::times(command, reply, usize::MAX)
    }

    pub fn times(command: &str, reply: Response, times: usize) -> Self {
        Self {
            command: command.to_string(),
            reply,
            times,
        }
    }
}

#[derive(Default)]
struct Data {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, Vec<(String, Vec<String>)>>,
    zsets: HashMap<String, Vec<(String, String)>>,
    next_entry: u64,
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Channel,
    Pattern,
}

struct Subscription {
    kind: Kind,
    target: String,
    writer: Arc<Mutex<TcpStream>>,
}

struct Node {
    data: Arc<Mutex<Data>>,
    password: String,
    overrides: Mutex<Vec<Override>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Clone, Default)]
pub struct FakeStore {
    data: Arc<Mutex<Data>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an ephemeral port serving this store and returns the port.
    pub fn serve(&self, password: &str, overrides: Vec<Override>) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let node = Arc::new(Node {
            data: Arc::clone(&self.data),
            password: password.to_string(),
            overrides: Mutex::new(overrides),
            subscriptions: Mutex::new(Vec::new()),
        });
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let node = Arc::clone(&node);
                thread::spawn(move || node.serve_connection(stream));
            }
        });
        Ok(port)
    }
}

impl Node {
    fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let mut reader = BufReader::new(stream);
        let mut authenticated = false;
        // Readiness checks connect and hang up without sending anything.
        while let Ok(command) = read_response(&mut reader) {
            let args: Vec<Vec<u8>> = command
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(|arg| arg.as_bytes().map(<[u8]>::to_vec))
                .collect();
            let reply = self.execute(&args, &mut authenticated, &writer);
            if writer.lock().unwrap().write_all(&encode(&reply)).is_err() {
                break;
            }
        }
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|sub| !Arc::ptr_eq(&sub.writer, &writer));
        Ok(())
    }

    fn execute(
        &self,
        args: &[Vec<u8>],
        authenticated: &mut bool,
        writer: &Arc<Mutex<TcpStream>>,
    ) -> Response {
        let name = text(arg(args, 0)).to_ascii_uppercase();
        if name == "AUTH" {
            if text(arg(args, 1)) == self.password {
                *authenticated = true;
                return Response::Simple("OK".into());
            }
            return Response::Error("ERR invalid password".into());
        }
        if !*authenticated {
            return Response::Error("NOAUTH Authentication required.".into());
        }

        let line = args.iter().map(|word| text(word)).collect::<Vec<_>>().join(" ");
        if let Some(reply) = self.take_override(&line) {
            return reply;
        }

        match name.as_str() {
            "SUBSCRIBE" => self.subscribe(Kind::Channel, args, writer),
            "PSUBSCRIBE" => self.subscribe(Kind::Pattern, args, writer),
            "UNSUBSCRIBE" => self.unsubscribe(Kind::Channel, args, writer),
            "PUNSUBSCRIBE" => self.unsubscribe(Kind::Pattern, args, writer),
            "PUBLISH" => self.publish(&text(arg(args, 1)), arg(args, 2)),
            _ => execute_data(&mut self.data.lock().unwrap(), &name, args),
        }
    }

    fn take_override(&self, line: &str) -> Option<Response> {
        let mut overrides = self.overrides.lock().unwrap();
        let entry = overrides
            .iter_mut()
            .find(|entry| entry.command == line && entry.times > 0)?;
        entry.times -= 1;
        Some(entry.reply.clone())
    }

    fn subscribe(&self, kind: Kind, args: &[Vec<u8>], writer: &Arc<Mutex<TcpStream>>) -> Response {
        let target = text(arg(args, 1));
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(Subscription {
            kind,
            target: target.clone(),
            writer: Arc::clone(writer),
        });
        let count = subscriptions
            .iter()
            .filter(|sub| Arc::ptr_eq(&sub.writer, writer))
            .count();
        let verb = if kind == Kind::Channel { "subscribe" } else { "psubscribe" };
        confirmation(verb, &target, count)
    }

    fn unsubscribe(
        &self,
        kind: Kind,
        args: &[Vec<u8>],
        writer: &Arc<Mutex<TcpStream>>,
    ) -> Response {
        let target = text(arg(args, 1));
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|sub| {
            !(Arc::ptr_eq(&sub.writer, writer) && sub.kind == kind && sub.target == target)
        });
        let count = subscriptions
            .iter()
            .filter(|sub| Arc::ptr_eq(&sub.writer, writer))
            .count();
        let verb = if kind == Kind::Channel { "unsubscribe" } else { "punsubscribe" };
        confirmation(verb, &target, count)
    }

    fn publish(&self, channel: &str, message: &[u8]) -> Response {
        let subscriptions = self.subscriptions.lock().unwrap();
        let mut delivered = 0;
        for sub in subscriptions.iter() {
            let frame = match sub.kind {
                Kind::Channel if sub.target == channel => Response::Array(Some(vec![
                    Response::bulk("message"),
                    Response::bulk(channel),
                    Response::bulk(message),
                ])),
                Kind::Pattern if glob_match(&sub.target, channel) => Response::Array(Some(vec![
                    Response::bulk("pmessage"),
                    Response::bulk(sub.target.as_str()),
                    Response::bulk(channel),
                    Response::bulk(message),
                ])),
                _ => continue,
            };
            if sub.writer.lock().unwrap().write_all(&encode(&frame)).is_ok() {
                delivered += 1;
            }
        }
        Response::Integer(delivered)
    }
}

fn execute_data(data: &mut Data, name: &str, args: &[Vec<u8>]) -> Response {
    let key = text(arg(args, 1));
    match name {
        "SET" => {
            data.strings.insert(arg(args, 1).to_vec(), arg(args, 2).to_vec());
            Response::Simple("OK".into())
        }
        "GET" => Response::Bulk(data.strings.get(arg(args, 1)).cloned()),
        "XADD" => {
            data.next_entry += 1;
            let id = format!("{}-0", data.next_entry);
            let fields = args.iter().skip(3).map(|field| text(field)).collect();
            data.streams.entry(key).or_default().push((id.clone(), fields));
            Response::bulk(id)
        }
        "XRANGE" => {
            let entries = data.streams.get(&key).cloned().unwrap_or_default();
            Response::Array(Some(
                entries
                    .into_iter()
                    .map(|(id, fields)| {
                        let entry = vec![Response::bulk(id), Response::bulk_array(fields)];
                        Response::Array(Some(entry))
                    })
                    .collect(),
            ))
        }
        "LPUSH" | "RPUSH" => {
            let list = data.lists.entry(key).or_default();
            for value in args.iter().skip(2) {
                if name == "LPUSH" {
                    list.push_front(text(value));
                } else {
                    list.push_back(text(value));
                }
            }
            Response::Integer(list.len() as i64)
        }
        "LPOP" | "RPOP" => {
            let list = data.lists.entry(key).or_default();
            let popped = if name == "LPOP" { list.pop_front() } else { list.pop_back() };
            popped.map_or(Response::Bulk(None), Response::bulk)
        }
        "LLEN" => Response::Integer(data.lists.get(&key).map_or(0, VecDeque::len) as i64),
        "LRANGE" => {
            let list: Vec<String> = data
                .lists
                .get(&key)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default();
            let range = index_range(list.len(), number(arg(args, 2)), number(arg(args, 3)));
            Response::bulk_array(&list[range])
        }
        "LREM" => {
            let count = number(arg(args, 2));
            let value = text(arg(args, 3));
            let list = data.lists.entry(key).or_default();
            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let mut positions: Vec<usize> = list
                .iter()
                .enumerate()
                .filter(|(_, item)| **item == value)
                .map(|(index, _)| index)
                .collect();
            if count < 0 {
                positions.reverse();
            }
            positions.truncate(limit);
            positions.sort_unstable();
            for index in positions.iter().rev() {
                list.remove(*index);
            }
            Response::Integer(positions.len() as i64)
        }
        "ZADD" => {
            let set = data.zsets.entry(key).or_default();
            let mut added = 0;
            for pair in args[2..].chunks(2) {
                let (score, member) = (text(&pair[0]), text(arg(pair, 1)));
                match set.iter_mut().find(|(existing, _)| *existing == member) {
                    Some(entry) => entry.1 = score,
                    None => {
                        set.push((member, score));
                        added += 1;
                    }
                }
            }
            Response::Integer(added)
        }
        "ZSCORE" => {
            let member = text(arg(args, 2));
            let score = data
                .zsets
                .get(&key)
                .and_then(|set| set.iter().find(|(existing, _)| *existing == member))
                .map(|(_, score)| score.clone());
            score.map_or(Response::Bulk(None), Response::bulk)
        }
        "ZRANGE" => {
            let mut set = data.zsets.get(&key).cloned().unwrap_or_default();
            set.sort_by(|a, b| score_of(&a.1).total_cmp(&score_of(&b.1)));
            let members: Vec<String> = set.into_iter().map(|(member, _)| member).collect();
            let range = index_range(members.len(), number(arg(args, 2)), number(arg(args, 3)));
            Response::bulk_array(&members[range])
        }
        other => Response::Error(format!("ERR unknown command '{other}'")),
    }
}

fn confirmation(verb: &str, target: &str, count: usize) -> Response {
    Response::Array(Some(vec![
        Response::bulk(verb),
        Response::bulk(target),
        Response::Integer(count as i64),
    ]))
}

/// Supports exact names and a single trailing `*`.
fn glob_match(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// Inclusive `start..=stop` with negative indexes counted from the end.
fn index_range(len: usize, start: i64, stop: i64) -> std::ops::Range<usize> {
    let len = len as i64;
    let normalize = |index: i64| if index < 0 { (len + index).max(0) } else { index };
    let (start, stop) = (normalize(start), normalize(stop).min(len - 1));
    if start > stop {
        return 0..0;
    }
    start as usize..stop as usize + 1
}

fn arg(args: &[Vec<u8>], index: usize) -> &[u8] {
    args.get(index).map_or(&[][..], Vec::as_slice)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn number(bytes: &[u8]) -> i64 {
    text(bytes).parse().unwrap_or(0)
}

fn score_of(score: &str) -> f64 {
    score.parse().unwrap_or(0.0)
}

/// Serializes a reply the way a server writes it.
pub fn encode(reply: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    write_reply(&mut out, reply);
    out
}

fn write_reply(out: &mut Vec<u8>, reply: &Response) {
    match reply {
        Response::Simple(text) => out.extend_from_slice(format!("+{text}\r\n").as_bytes()),
        Response::Error(text) => out.extend_from_slice(format!("-{text}\r\n").as_bytes()),
        Response::Integer(value) => out.extend_from_slice(format!(":{value}\r\n").as_bytes()),
        Response::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        Response::Bulk(Some(payload)) => {
            out.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\r\n");
        }
        Response::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        Response::Array(Some(items)) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_reply(out, item);
            }
        }
    }
}
