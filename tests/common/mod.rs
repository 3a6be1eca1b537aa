#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use stservo_controller::protocol::{PacketHandler, checksum};
use stservo_controller::transport::Transport;

/// Status packet as a servo would send it.
pub fn status_frame(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xFF, 0xFF, id, (params.len() + 2) as u8, error];
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[2..]));
    frame
}

pub fn ack(id: u8) -> Option<Vec<u8>> {
    Some(status_frame(id, 0, &[]))
}

pub fn value_u8(id: u8, value: u8) -> Option<Vec<u8>> {
    Some(status_frame(id, 0, &[value]))
}

pub fn value_u16(id: u8, value: u16) -> Option<Vec<u8>> {
    Some(status_frame(id, 0, &value.to_le_bytes()))
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Option<Vec<u8>>>,
    pending: Vec<u8>,
    sent: Vec<Vec<u8>>,
    receive_calls: usize,
    closed: bool,
}

/// Transport that answers each sent frame with the next scripted reply.
///
/// `None` in the script means the servo stays silent for that exchange.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, reply: Option<Vec<u8>>) -> &Self {
        self.script.lock().unwrap().replies.push_back(reply);
        self
    }

    /// A successful ping is two exchanges: PING then a model number read.
    pub fn ping_ok(&self, id: u8, model: u16) -> &Self {
        self.reply(ack(id)).reply(value_u16(id, model))
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.script.lock().unwrap().receive_calls
    }

    pub fn unused_replies(&self) -> usize {
        self.script.lock().unwrap().replies.len()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().unwrap().closed
    }

    pub fn handler(&self) -> PacketHandler<ScriptedTransport> {
        PacketHandler::new(self.clone()).with_timeout(Duration::from_millis(5))
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.sent.push(bytes.to_vec());
        // Broadcast frames get no reply and consume no script entry.
        if bytes.get(2) == Some(&0xFE) {
            return Ok(());
        }
        if let Some(Some(reply)) = script.replies.pop_front() {
            script.pending.extend_from_slice(&reply);
        }
        Ok(())
    }

    fn receive(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        {
            let mut script = self.script.lock().unwrap();
            script.receive_calls += 1;
            if !script.pending.is_empty() {
                let take = max_len.min(script.pending.len());
                return Ok(script.pending.drain(..take).collect());
            }
        }
        thread::sleep(timeout);
        Err(io::Error::new(io::ErrorKind::TimedOut, "scripted silence"))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.script.lock().unwrap().pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.script.lock().unwrap().closed = true;
    }
}
