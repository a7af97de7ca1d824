// Keystroke-stream command reconstruction
//
// The parser is fed every raw input chunk before it is forwarded to the
// target, and every output chunk coming back. From the input side it
// maintains a line editor (cursor movement, DEL, kill-line); from the
// output side it tracks the current terminal line so it can snapshot the
// prompt and recover commands that the editor cannot reconstruct (history
// recall, tab completion).
//
// All state transitions are per byte, so feeding a stream byte-by-byte or
// in arbitrary chunks yields identical results.

use log::debug;
use regex::Regex;

use crate::rules::{CommandRule, CompiledRules};

/// Sent to the target to cancel the line being typed (Ctrl-U + CR).
pub const LINE_CANCEL: &[u8] = b"\x15\r";

const REDIS_TOKEN_PATTERN: &str = r#"("[^"]*"|'[^']*'|\S+)"#;

/// How committed commands are delimited for a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segmenter {
    /// Line per command, echo-assisted (ssh, telnet).
    Shell,
    /// Line per command, tokenized instead of prompt-watched.
    Redis,
    /// Statements run to the `;` terminator, possibly multi-line.
    Sql,
    /// Line per command, no echo assistance (mongodb).
    Line,
}

impl Segmenter {
    fn for_protocol(protocol: &str) -> Self {
        match protocol {
            "redis" => Segmenter::Redis,
            "mysql" | "postgresql" => Segmenter::Sql,
            "mongodb" => Segmenter::Line,
            _ => Segmenter::Shell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Plain,
    Esc,
    Csi,
    Ss3,
    Osc,
}

/// Incremental UTF-8 decoder for a byte-fed stream.
#[derive(Default)]
struct Utf8Pending(Vec<u8>);

impl Utf8Pending {
    fn push(&mut self, byte: u8) -> Option<char> {
        self.0.push(byte);
        match std::str::from_utf8(&self.0) {
            Ok(s) => {
                let c = s.chars().next();
                self.0.clear();
                c
            }
            Err(_) if self.0.len() >= 4 => {
                self.0.clear();
                None
            }
            Err(_) => None,
        }
    }
}

pub struct TermParser {
    session_id: String,
    segmenter: Segmenter,
    rules: CompiledRules,
    redis_tokens: Regex,

    // input line editor
    line: Vec<char>,
    cursor: usize,
    opaque: bool,
    pending_sql: String,
    in_esc: EscState,
    in_utf8: Utf8Pending,
    last_was_cr: bool,

    // output tracking
    out_line: String,
    out_esc: EscState,
    out_utf8: Utf8Pending,
    last_prompt: String,
    snap_prompt: bool,

    commands: Vec<String>,
}

impl TermParser {
    pub fn new(session_id: &str, protocol: &str, rules: Vec<CommandRule>) -> Self {
        Self {
            session_id: session_id.to_string(),
            segmenter: Segmenter::for_protocol(protocol),
            rules: CompiledRules::compile(protocol, &rules),
            redis_tokens: Regex::new(REDIS_TOKEN_PATTERN).expect("static pattern"),
            line: Vec::new(),
            cursor: 0,
            opaque: false,
            pending_sql: String::new(),
            in_esc: EscState::Plain,
            in_utf8: Utf8Pending::default(),
            last_was_cr: false,
            out_line: String::new(),
            out_esc: EscState::Plain,
            out_utf8: Utf8Pending::default(),
            last_prompt: String::new(),
            snap_prompt: true,
            commands: Vec::new(),
        }
    }

    /// Feed raw client input.
    ///
    /// Returns the command committed by this chunk (the last one, if the
    /// chunk carried several line endings) and whether it is forbidden.
    /// When a forbidden command is found, processing stops immediately so
    /// the caller can cancel the line without forwarding anything.
    pub fn add_input(&mut self, bytes: &[u8]) -> (Option<String>, bool) {
        let mut committed = None;
        for &b in bytes {
            if let Some(cmd) = self.input_byte(b) {
                let forbidden = self.rules.is_forbidden(&cmd);
                debug!(
                    "session {}: command {:?} forbidden={}",
                    self.session_id, cmd, forbidden
                );
                if forbidden {
                    return (Some(cmd), true);
                }
                committed = Some(cmd);
            }
        }
        (committed, false)
    }

    fn input_byte(&mut self, b: u8) -> Option<String> {
        // snapshot the prompt at the first real keystroke of a new line;
        // trailing CR/LF of the previous commit must not consume it
        if self.snap_prompt && b != b'\r' && b != b'\n' {
            self.last_prompt = self.out_line.clone();
            self.snap_prompt = false;
        }

        let was_cr = std::mem::replace(&mut self.last_was_cr, false);

        match self.in_esc {
            EscState::Esc => {
                self.in_esc = match b {
                    b'[' => EscState::Csi,
                    b'O' => EscState::Ss3,
                    _ => EscState::Plain,
                };
                return None;
            }
            EscState::Csi => {
                if (0x40..=0x7e).contains(&b) {
                    self.in_esc = EscState::Plain;
                    match b {
                        b'C' => self.cursor = (self.cursor + 1).min(self.line.len()),
                        b'D' => self.cursor = self.cursor.saturating_sub(1),
                        // history recall replaces the line with text we
                        // never saw; fall back to the echo on commit
                        b'A' | b'B' => self.opaque = true,
                        _ => {}
                    }
                }
                return None;
            }
            EscState::Ss3 => {
                self.in_esc = EscState::Plain;
                match b {
                    b'C' => self.cursor = (self.cursor + 1).min(self.line.len()),
                    b'D' => self.cursor = self.cursor.saturating_sub(1),
                    b'A' | b'B' => self.opaque = true,
                    _ => {}
                }
                return None;
            }
            EscState::Osc | EscState::Plain => {}
        }

        match b {
            0x1b => {
                self.in_esc = EscState::Esc;
                None
            }
            0x7f => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.line.remove(self.cursor);
                }
                None
            }
            0x15 => {
                // kill-line; also how the gateway cancels a forbidden line
                self.reset_line();
                None
            }
            0x03 => {
                self.reset_line();
                None
            }
            0x09 => {
                // completion output is target-side; the editor no longer
                // knows the true line
                self.opaque = true;
                None
            }
            b'\r' => {
                self.last_was_cr = true;
                self.commit()
            }
            b'\n' => {
                if was_cr {
                    None
                } else {
                    self.commit()
                }
            }
            _ if b < 0x20 => None,
            _ => {
                if let Some(c) = self.in_utf8.push(b) {
                    self.line.insert(self.cursor, c);
                    self.cursor += 1;
                }
                None
            }
        }
    }

    fn reset_line(&mut self) {
        self.line.clear();
        self.cursor = 0;
        self.opaque = false;
    }

    fn commit(&mut self) -> Option<String> {
        let raw = if self.opaque {
            self.echo_command()
        } else {
            self.line.iter().collect::<String>()
        };
        self.reset_line();
        self.snap_prompt = true;

        let cmd = match self.segmenter {
            Segmenter::Shell | Segmenter::Line => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return None;
                }
                trimmed.to_string()
            }
            Segmenter::Redis => {
                let tokens: Vec<&str> = self
                    .redis_tokens
                    .find_iter(&raw)
                    .map(|m| m.as_str())
                    .collect();
                if tokens.is_empty() {
                    return None;
                }
                tokens.join(" ")
            }
            Segmenter::Sql => {
                if !self.pending_sql.is_empty() {
                    self.pending_sql.push(' ');
                }
                self.pending_sql.push_str(raw.trim());
                match self.pending_sql.find(';') {
                    Some(idx) => {
                        let stmt = self.pending_sql[..=idx].trim().to_string();
                        self.pending_sql = self.pending_sql[idx + 1..].trim_start().to_string();
                        if stmt == ";" {
                            return None;
                        }
                        stmt
                    }
                    None => return None,
                }
            }
        };

        self.commands.push(cmd.clone());
        Some(cmd)
    }

    /// Command as echoed by the target: the current output line minus the
    /// prompt snapshot taken when the user started typing.
    fn echo_command(&self) -> String {
        let line = self.out_line.as_str();
        let body = match line.strip_prefix(self.last_prompt.as_str()) {
            Some(rest) => rest,
            None => line,
        };
        body.to_string()
    }

    /// Feed target output. Keeps the current-line and prompt snapshot in
    /// sync for echo-based command recovery.
    pub fn add_output(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match self.out_esc {
                EscState::Esc => {
                    self.out_esc = match b {
                        b'[' => EscState::Csi,
                        b']' => EscState::Osc,
                        b'O' => EscState::Ss3,
                        _ => EscState::Plain,
                    };
                    continue;
                }
                EscState::Csi => {
                    if (0x40..=0x7e).contains(&b) {
                        self.out_esc = EscState::Plain;
                    }
                    continue;
                }
                EscState::Ss3 => {
                    self.out_esc = EscState::Plain;
                    continue;
                }
                EscState::Osc => {
                    // terminated by BEL or ST (ESC \); treat a bare ESC as
                    // the start of the terminator
                    if b == 0x07 {
                        self.out_esc = EscState::Plain;
                    } else if b == 0x1b {
                        self.out_esc = EscState::Esc;
                    }
                    continue;
                }
                EscState::Plain => {}
            }

            match b {
                0x1b => self.out_esc = EscState::Esc,
                b'\n' => self.out_line.clear(),
                b'\r' => self.out_line.clear(),
                0x08 => {
                    self.out_line.pop();
                }
                0x07 => {}
                _ if b < 0x20 => {}
                _ => {
                    if let Some(c) = self.out_utf8.push(b) {
                        self.out_line.push(c);
                    }
                }
            }
        }
    }

    /// Flush the partially typed command as a final history entry.
    pub fn close(&mut self, prompt: &str) -> Option<String> {
        self.last_prompt = prompt.to_string();
        let mut remainder = if self.opaque {
            self.echo_command()
        } else {
            self.line.iter().collect::<String>()
        };
        if self.segmenter == Segmenter::Sql && !self.pending_sql.is_empty() {
            let mut joined = std::mem::take(&mut self.pending_sql);
            if !remainder.trim().is_empty() {
                joined.push(' ');
                joined.push_str(remainder.trim());
            }
            remainder = joined;
        }
        self.reset_line();

        let trimmed = remainder.trim();
        if trimmed.is_empty() {
            return None;
        }
        let cmd = trimmed.to_string();
        self.commands.push(cmd.clone());
        Some(cmd)
    }

    /// All commands committed so far, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// The prompt snapshot taken when the current line started.
    pub fn last_prompt(&self) -> &str {
        &self.last_prompt
    }

    /// Current output line (used as the close-flush prompt by the caller).
    pub fn current_output_line(&self) -> &str {
        &self.out_line
    }

    /// Cursor position within the edited line.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
