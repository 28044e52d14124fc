//! Minimal reconstruction of a console's visible text. The Codex CLI paints
//! with ANSI control sequences; for snapshot purposes only the printable
//! stream, carriage-return overwrites, and line feeds matter.

const MAX_SCROLLBACK_LINES: usize = 2000;
const TAB_STOP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Ground,
    Escape,
    Csi,
    Osc,
    OscEscape,
    Charset,
}

/// Line-oriented screen model fed raw PTY bytes. `\r` rewinds the cursor to
/// overwrite the current line, `\n` commits it to scrollback. Escape
/// sequences are stripped; `CSI K` and `CSI 2J` are honored because the
/// Codex spinner leans on them.
pub struct Screen {
    lines: Vec<String>,
    current: Vec<char>,
    col: usize,
    state: ParseState,
    csi_params: String,
    utf8_carry: Vec<u8>,
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

impl Screen {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            current: Vec::new(),
            col: 0,
            state: ParseState::Ground,
            csi_params: String::new(),
            utf8_carry: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let mut buffer = std::mem::take(&mut self.utf8_carry);
        buffer.extend_from_slice(bytes);

        let (valid, carry) = match std::str::from_utf8(&buffer) {
            Ok(text) => (text.to_string(), Vec::new()),
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                let tail = buffer[valid_up_to..].to_vec();
                // A tail longer than a UTF-8 sequence is garbage, not a
                // split character.
                if tail.len() > 4 {
                    (String::from_utf8_lossy(&buffer).into_owned(), Vec::new())
                } else {
                    let valid = std::str::from_utf8(&buffer[..valid_up_to])
                        .unwrap_or_default()
                        .to_string();
                    (valid, tail)
                }
            }
        };
        self.utf8_carry = carry;

        for ch in valid.chars() {
            self.feed_char(ch);
        }
    }

    fn feed_char(&mut self, ch: char) {
        match self.state {
            ParseState::Ground => match ch {
                '\u{1b}' => self.state = ParseState::Escape,
                '\r' => self.col = 0,
                '\n' => self.commit_line(),
                '\u{8}' => self.col = self.col.saturating_sub(1),
                '\t' => {
                    let next_stop = (self.col / TAB_STOP + 1) * TAB_STOP;
                    while self.col < next_stop {
                        self.put(' ');
                    }
                }
                c if (c as u32) < 0x20 => {}
                c => self.put(c),
            },
            ParseState::Escape => match ch {
                '[' => {
                    self.csi_params.clear();
                    self.state = ParseState::Csi;
                }
                ']' => self.state = ParseState::Osc,
                '(' | ')' => self.state = ParseState::Charset,
                _ => self.state = ParseState::Ground,
            },
            ParseState::Csi => {
                if ('\u{40}'..='\u{7e}').contains(&ch) {
                    self.apply_csi(ch);
                    self.state = ParseState::Ground;
                } else {
                    self.csi_params.push(ch);
                }
            }
            ParseState::Osc => match ch {
                '\u{7}' => self.state = ParseState::Ground,
                '\u{1b}' => self.state = ParseState::OscEscape,
                _ => {}
            },
            ParseState::OscEscape => self.state = ParseState::Ground,
            ParseState::Charset => self.state = ParseState::Ground,
        }
    }

    fn apply_csi(&mut self, final_byte: char) {
        match final_byte {
            'K' => {
                // Erase in line. Mode 0 (default) clears from the cursor.
                if self.csi_params.is_empty() || self.csi_params.starts_with('0') {
                    self.current.truncate(self.col);
                }
            }
            'J' => {
                if self.csi_params.contains('2') || self.csi_params.contains('3') {
                    self.lines.clear();
                    self.current.clear();
                    self.col = 0;
                }
            }
            _ => {}
        }
    }

    fn put(&mut self, ch: char) {
        if self.col < self.current.len() {
            self.current[self.col] = ch;
        } else {
            while self.current.len() < self.col {
                self.current.push(' ');
            }
            self.current.push(ch);
        }
        self.col += 1;
    }

    fn commit_line(&mut self) {
        let rendered: String = self.current.iter().collect();
        self.lines.push(rendered.trim_end().to_string());
        self.current.clear();
        self.col = 0;
        if self.lines.len() > MAX_SCROLLBACK_LINES {
            let overflow = self.lines.len() - MAX_SCROLLBACK_LINES;
            self.lines.drain(..overflow);
        }
    }

    /// Visible text: committed lines plus the partial line under the cursor,
    /// trailing whitespace trimmed, joined and terminated with `\n`.
    pub fn snapshot(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        let partial: String = self.current.iter().collect();
        let partial = partial.trim_end();
        if !partial.is_empty() {
            out.push_str(partial);
            out.push('\n');
        }
        out
    }
}
