//! Line-oriented TCP client for the target-control daemon's control port.
//!
//! The wire format is a Telnet subset: IAC (0xFF) introduces a 2-3 byte
//! option-negotiation command, everything else is line-oriented text ending
//! in CR/LF (CR and NUL are filtered). Negotiation follows the classic
//! Q-method automaton (RFC 1143): each option has two independent states,
//! one for what *we* do and one for what the *peer* does, each a
//! `{No, Yes, WantYes, WantNo, WantYesOpposite, WantNoOpposite}` variant.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::{Error, Result};

const IAC: u8 = 255;
const WILL: u8 = 251;
const WONT: u8 = 252;
const DO: u8 = 253;
const DONT: u8 = 254;

const OPT_ECHO: u8 = 1;
const OPT_SUPPRESS_GO_AHEAD: u8 = 3;

/// Per-option negotiation state, independently tracked for what we offer
/// ("us") and what we ask of the peer ("him").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionState {
  No,
  Yes,
  WantYes,
  WantNo,
  WantYesOpposite,
  WantNoOpposite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
  Us,
  Him,
}

struct OptionNegotiator {
  us: std::collections::HashMap<u8, OptionState>,
  him: std::collections::HashMap<u8, OptionState>,
}

impl OptionNegotiator {
  fn new() -> Self {
    OptionNegotiator {
      us: std::collections::HashMap::new(),
      him: std::collections::HashMap::new(),
    }
  }

  fn state(&self, side: Side, option: u8) -> OptionState {
    let map = match side {
      Side::Us => &self.us,
      Side::Him => &self.him,
    };
    *map.get(&option).unwrap_or(&OptionState::No)
  }

  fn set(&mut self, side: Side, option: u8, state: OptionState) {
    let map = match side {
      Side::Us => &mut self.us,
      Side::Him => &mut self.him,
    };
    map.insert(option, state);
  }

  /// Start negotiation of `option` on `side` by sending the corresponding
  /// positive request (WILL for us, DO for him), returning the bytes to
  /// write.
  fn request(&mut self, side: Side, option: u8) -> Vec<u8> {
    let current = self.state(side, option);
    match current {
      OptionState::No => {
        self.set(side, option, OptionState::WantYes);
        let cmd = match side {
          Side::Us => WILL,
          Side::Him => DO,
        };
        vec![IAC, cmd, option]
      }
      _ => Vec::new(),
    }
  }

  /// Process an incoming 3-byte command `(cmd, option)` received on `side`
  /// (the side the *peer* is declaring: a WILL/WONT from the peer concerns
  /// "him"; a DO/DONT from the peer concerns "us"). Returns the reply bytes
  /// to send, if any.
  fn receive(&mut self, side: Side, cmd: u8, option: u8) -> Vec<u8> {
    let positive = matches!(cmd, WILL | DO);
    let (accept, refuse) = match side {
      Side::Us => (WILL, WONT),
      Side::Him => (DO, DONT),
    };
    let current = self.state(side, option);

    match (current, positive) {
      (OptionState::No, true) => {
        self.set(side, option, OptionState::Yes);
        vec![IAC, accept, option]
      }
      (OptionState::No, false) => Vec::new(),
      (OptionState::Yes, true) => Vec::new(),
      (OptionState::Yes, false) => {
        self.set(side, option, OptionState::No);
        vec![IAC, refuse, option]
      }
      (OptionState::WantYes, true) => {
        self.set(side, option, OptionState::Yes);
        Vec::new()
      }
      (OptionState::WantYes, false) => {
        self.set(side, option, OptionState::No);
        Vec::new()
      }
      (OptionState::WantNo, true) => {
        self.set(side, option, OptionState::Yes);
        Vec::new()
      }
      (OptionState::WantNo, false) => {
        self.set(side, option, OptionState::No);
        Vec::new()
      }
      (OptionState::WantYesOpposite, true) => {
        self.set(side, option, OptionState::WantNo);
        vec![IAC, refuse, option]
      }
      (OptionState::WantYesOpposite, false) => {
        self.set(side, option, OptionState::No);
        Vec::new()
      }
      (OptionState::WantNoOpposite, true) => {
        self.set(side, option, OptionState::No);
        Vec::new()
      }
      (OptionState::WantNoOpposite, false) => {
        self.set(side, option, OptionState::WantYes);
        vec![IAC, accept, option]
      }
    }
  }

  fn is_enabled(&self, side: Side, option: u8) -> bool {
    matches!(self.state(side, option), OptionState::Yes)
  }
}

/// Fixed options struct for one control-protocol session (spec's "dynamic
/// config objects" replacement).
#[derive(Debug, Clone)]
pub struct ControlOptions {
  pub login_prompt: Option<String>,
  pub password_prompt: Option<String>,
  pub shell_prompt: String,
  pub user: Option<String>,
  pub password: Option<String>,
  pub enable_echo: bool,
  pub suppress_go_ahead: bool,
  pub connect_timeout: Duration,
  pub exec_timeout: Duration,
  pub line_timeout: Duration,
}

impl Default for ControlOptions {
  fn default() -> Self {
    ControlOptions {
      login_prompt: None,
      password_prompt: None,
      shell_prompt: "> ".to_string(),
      user: None,
      password: None,
      enable_echo: true,
      suppress_go_ahead: true,
      connect_timeout: Duration::from_secs(5),
      exec_timeout: Duration::from_secs(10),
      line_timeout: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
  Disconnected,
  Connecting,
  Connected,
  Disconnecting,
}

/// A connected session against the target-control daemon's control port.
pub struct ControlClient {
  stream: TcpStream,
  state: ClientState,
  negotiator: OptionNegotiator,
  options: ControlOptions,
  /// Bytes read past the end of the last logical line, carried over to the
  /// next read.
  residual: Vec<u8>,
}

impl ControlClient {
  pub async fn connect(host: &str, port: u16, options: ControlOptions) -> Result<Self> {
    let stream = timeout(options.connect_timeout, TcpStream::connect((host, port)))
      .await
      .map_err(|_| Error::CommandTimeout("control-protocol connect".into()))??;

    let mut client = ControlClient {
      stream,
      state: ClientState::Connecting,
      negotiator: OptionNegotiator::new(),
      options,
      residual: Vec::new(),
    };

    client.negotiate().await?;
    client.consume_login_sequence().await?;
    client.state = ClientState::Connected;
    Ok(client)
  }

  /// Request SUPPRESS-GO-AHEAD on both halves and echo from the server;
  /// process option-negotiation traffic until both mandatory options have
  /// settled or the connect timeout elapses.
  async fn negotiate(&mut self) -> Result<()> {
    let mut outbound = Vec::new();
    outbound.extend(self.negotiator.request(Side::Us, OPT_SUPPRESS_GO_AHEAD));
    outbound.extend(self.negotiator.request(Side::Him, OPT_SUPPRESS_GO_AHEAD));
    if self.options.enable_echo {
      outbound.extend(self.negotiator.request(Side::Him, OPT_ECHO));
    }
    if !outbound.is_empty() {
      self.stream.write_all(&outbound).await?;
    }

    let deadline = tokio::time::Instant::now() + self.options.connect_timeout;
    loop {
      if self.negotiator.is_enabled(Side::Us, OPT_SUPPRESS_GO_AHEAD) && self.negotiator.is_enabled(Side::Him, OPT_SUPPRESS_GO_AHEAD) {
        return Ok(());
      }
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        return Err(Error::ControlProtocolError(
          "peer did not negotiate SUPPRESS-GO-AHEAD within the connect timeout".into(),
        ));
      }
      match timeout(remaining, self.read_and_process_negotiation()).await {
        Ok(Ok(_)) => continue,
        Ok(Err(err)) => return Err(err),
        Err(_) => {
          return Err(Error::ControlProtocolError(
            "peer did not negotiate SUPPRESS-GO-AHEAD within the connect timeout".into(),
          ))
        }
      }
    }
  }

  async fn read_and_process_negotiation(&mut self) -> Result<()> {
    let mut buf = [0u8; 256];
    let n = self.stream.read(&mut buf).await?;
    if n == 0 {
      return Err(Error::ControlProtocolError("connection closed during negotiation".into()));
    }
    let mut i = 0;
    while i < n {
      if buf[i] == IAC && i + 2 < n {
        let cmd = buf[i + 1];
        let option = buf[i + 2];
        let side = match cmd {
          WILL | WONT => Side::Him,
          DO | DONT => Side::Us,
          _ => {
            i += 1;
            continue;
          }
        };
        let reply = self.negotiator.receive(side, cmd, option);
        if !reply.is_empty() {
          self.stream.write_all(&reply).await?;
        }
        i += 3;
      } else {
        i += 1;
      }
    }
    Ok(())
  }

  /// Consume the login → password → shell prompt sequence, replying with
  /// the configured credentials.
  async fn consume_login_sequence(&mut self) -> Result<()> {
    if let Some(prompt) = self.options.login_prompt.clone() {
      self.wait_for(&prompt).await?;
      let user = self.options.user.clone().unwrap_or_default();
      self.write_line(&user).await?;
    }
    if let Some(prompt) = self.options.password_prompt.clone() {
      self.wait_for(&prompt).await?;
      let password = self.options.password.clone().unwrap_or_default();
      self.write_line(&password).await?;
    }
    self.wait_for(&self.options.shell_prompt.clone()).await?;
    Ok(())
  }

  /// Read raw text (processing and discarding any interleaved
  /// option-negotiation traffic) until `needle` appears in the accumulated
  /// buffer, honoring `line_timeout`.
  async fn wait_for(&mut self, needle: &str) -> Result<String> {
    let mut acc = String::from_utf8_lossy(&self.residual).into_owned();
    self.residual.clear();
    loop {
      if acc.contains(needle) {
        return Ok(acc);
      }
      let chunk = self.read_chunk(self.options.line_timeout).await?;
      acc.push_str(&chunk);
    }
  }

  /// Read one chunk of raw bytes, decoding IAC sequences in-line and
  /// returning the plain-text remainder as a lossy string.
  async fn read_chunk(&mut self, timeout_duration: Duration) -> Result<String> {
    let mut buf = [0u8; 1024];
    let n = match timeout(timeout_duration, self.stream.read(&mut buf)).await {
      Ok(Ok(0)) => return Err(Error::ControlProtocolError("connection closed".into())),
      Ok(Ok(n)) => n,
      Ok(Err(err)) => return Err(err.into()),
      Err(_) => return Err(Error::CommandTimeout("control-protocol read".into())),
    };

    let mut text = Vec::with_capacity(n);
    let mut i = 0;
    while i < n {
      match buf[i] {
        IAC if i + 1 < n && (buf[i + 1] == WILL || buf[i + 1] == WONT || buf[i + 1] == DO || buf[i + 1] == DONT) && i + 2 < n => {
          let cmd = buf[i + 1];
          let option = buf[i + 2];
          let side = if matches!(cmd, WILL | WONT) { Side::Him } else { Side::Us };
          let reply = self.negotiator.receive(side, cmd, option);
          if !reply.is_empty() {
            self.stream.write_all(&reply).await?;
          }
          i += 3;
        }
        IAC if i + 1 < n => {
          // two-byte IAC command (e.g. a bare IAC escaping a literal 0xFF).
          i += 2;
        }
        b'\r' | 0 => {
          i += 1;
        }
        byte => {
          text.push(byte);
          i += 1;
        }
      }
    }
    Ok(String::from_utf8_lossy(&text).into_owned())
  }

  async fn write_line(&mut self, line: &str) -> Result<()> {
    self.stream.write_all(line.as_bytes()).await?;
    self.stream.write_all(b"\n").await?;
    Ok(())
  }

  /// Run one command to completion: reject re-entry while another command
  /// is outstanding, write the command, collect output until the shell
  /// prompt or `timeout` reappears, and post-process the response.
  pub async fn exec(&mut self, cmd: &str, exec_timeout: Option<Duration>) -> Result<String> {
    if self.state != ClientState::Connected {
      return Err(Error::ControlProtocolError("exec on a client that is not connected".into()));
    }

    let effective_timeout = exec_timeout.unwrap_or(self.options.exec_timeout);
    self.write_line(cmd).await?;

    let shell_prompt = self.options.shell_prompt.clone();
    let mut acc = String::from_utf8_lossy(&self.residual).into_owned();
    self.residual.clear();
    let deadline = tokio::time::Instant::now() + effective_timeout;

    loop {
      if let Some(pos) = acc.find(&shell_prompt) {
        let body = &acc[..pos];
        return Ok(postprocess(body));
      }
      let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
      if remaining.is_zero() {
        return Err(Error::CommandTimeout(cmd.to_string()));
      }
      let chunk = self.read_chunk(remaining).await?;
      acc.push_str(&chunk);
    }
  }

  /// Idempotent: closing an already-disconnected client is a no-op.
  pub async fn disconnect(&mut self) -> Result<()> {
    if self.state == ClientState::Disconnected {
      return Ok(());
    }
    self.state = ClientState::Disconnecting;
    let _ = self.stream.shutdown().await;
    self.state = ClientState::Disconnected;
    Ok(())
  }

  pub fn is_connected(&self) -> bool {
    self.state == ClientState::Connected
  }
}

/// Apply backspace-deletion, then trim whitespace and non-printable
/// characters from each line, dropping empty lines.
fn postprocess(body: &str) -> String {
  let deleted = apply_backspaces(body);
  deleted
    .lines()
    .map(|line| line.chars().filter(|c| !c.is_control() || *c == '\t').collect::<String>())
    .map(|line| line.trim().to_string())
    .filter(|line| !line.is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}

fn apply_backspaces(input: &str) -> String {
  let mut out: Vec<char> = Vec::new();
  for c in input.chars() {
    if c == '\u{8}' {
      out.pop();
    } else {
      out.push(c);
    }
  }
  out.into_iter().collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backspaces_delete_the_preceding_character() {
    assert_eq!(apply_backspaces("abc\u{8}\u{8}d"), "ad");
  }

  #[test]
  fn postprocess_trims_and_drops_empty_lines() {
    let body = "  ** Programming Finished **  \n\n\tok\n";
    assert_eq!(postprocess(body), "** Programming Finished **\nok");
  }

  #[test]
  fn option_negotiator_accepts_peer_will_when_previously_unasked() {
    let mut negotiator = OptionNegotiator::new();
    let reply = negotiator.receive(Side::Him, WILL, OPT_SUPPRESS_GO_AHEAD);
    assert_eq!(reply, vec![IAC, DO, OPT_SUPPRESS_GO_AHEAD]);
    assert!(negotiator.is_enabled(Side::Him, OPT_SUPPRESS_GO_AHEAD));
  }

  #[test]
  fn option_negotiator_completes_a_self_initiated_request() {
    let mut negotiator = OptionNegotiator::new();
    let outbound = negotiator.request(Side::Us, OPT_SUPPRESS_GO_AHEAD);
    assert_eq!(outbound, vec![IAC, WILL, OPT_SUPPRESS_GO_AHEAD]);
    let reply = negotiator.receive(Side::Us, DO, OPT_SUPPRESS_GO_AHEAD);
    assert!(reply.is_empty());
    assert!(negotiator.is_enabled(Side::Us, OPT_SUPPRESS_GO_AHEAD));
  }
}
