// Copyright 2025 Shrike Contributors.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The reply boundary. Command handlers speak to an abstract builder;
//! protocol front-ends render the verbs onto the wire. The capturing
//! implementation backs tests and command squashing.

use common::OpStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Redis,
    Memcache,
}

pub trait ReplyBuilder {
    fn protocol(&self) -> Protocol;

    fn send_ok(&mut self) {
        self.send_simple_string("OK");
    }

    /// Value stored; "OK" for Redis, "STORED" for memcache.
    fn send_stored(&mut self);

    /// A conditional set declined to run.
    fn send_set_skipped(&mut self);

    fn send_error(&mut self, msg: &str);

    fn send_error_status(&mut self, status: OpStatus) {
        self.send_error(&status.to_string());
    }

    fn send_null(&mut self);

    fn send_simple_string(&mut self, s: &str);

    fn send_bulk_string(&mut self, s: &[u8]);

    fn send_long(&mut self, v: i64);

    fn send_double(&mut self, v: f64);

    fn start_array(&mut self, len: usize);

    // memcache retrieval surface
    fn send_value(&mut self, key: &[u8], value: &[u8], mc_flag: u32, mc_ver: u64);

    fn send_miss(&mut self);

    fn send_get_end(&mut self);
}

/// A reply captured as a value, for tests and internal consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Stored,
    SetSkipped,
    Error(String),
    Null,
    Simple(String),
    Bulk(Vec<u8>),
    Long(i64),
    Double(f64),
    ArrayHeader(usize),
    Value {
        key: Vec<u8>,
        value: Vec<u8>,
        mc_flag: u32,
        mc_ver: u64,
    },
    Miss,
    GetEnd,
}

pub struct CapturingReplyBuilder {
    protocol: Protocol,
    pub replies: Vec<Reply>,
}

impl CapturingReplyBuilder {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            replies: Vec::new(),
        }
    }

    pub fn take(&mut self) -> Vec<Reply> {
        std::mem::take(&mut self.replies)
    }
}

impl ReplyBuilder for CapturingReplyBuilder {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn send_stored(&mut self) {
        self.replies.push(Reply::Stored);
    }

    fn send_set_skipped(&mut self) {
        self.replies.push(Reply::SetSkipped);
    }

    fn send_error(&mut self, msg: &str) {
        self.replies.push(Reply::Error(msg.to_string()));
    }

    fn send_null(&mut self) {
        self.replies.push(Reply::Null);
    }

    fn send_simple_string(&mut self, s: &str) {
        self.replies.push(Reply::Simple(s.to_string()));
    }

    fn send_bulk_string(&mut self, s: &[u8]) {
        self.replies.push(Reply::Bulk(s.to_vec()));
    }

    fn send_long(&mut self, v: i64) {
        self.replies.push(Reply::Long(v));
    }

    fn send_double(&mut self, v: f64) {
        self.replies.push(Reply::Double(v));
    }

    fn start_array(&mut self, len: usize) {
        self.replies.push(Reply::ArrayHeader(len));
    }

    fn send_value(&mut self, key: &[u8], value: &[u8], mc_flag: u32, mc_ver: u64) {
        self.replies.push(Reply::Value {
            key: key.to_vec(),
            value: value.to_vec(),
            mc_flag,
            mc_ver,
        });
    }

    fn send_miss(&mut self) {
        self.replies.push(Reply::Miss);
    }

    fn send_get_end(&mut self) {
        self.replies.push(Reply::GetEnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_in_order() {
        let mut rb = CapturingReplyBuilder::new(Protocol::Redis);
        rb.send_ok();
        rb.start_array(2);
        rb.send_bulk_string(b"a");
        rb.send_null();
        assert_eq!(
            rb.take(),
            vec![
                Reply::Simple("OK".into()),
                Reply::ArrayHeader(2),
                Reply::Bulk(b"a".to_vec()),
                Reply::Null,
            ]
        );
    }
}
