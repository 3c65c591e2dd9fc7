//! Application line parsing for PRIVMSG / PUBMSG payloads.
//!
//! Grammar: `from '!' to '!' remainder`. Only the first two `!` are
//! significant; the remainder (command, arguments, optional `!tbond` proof)
//! is carried through byte-for-byte and never interpreted here.

/// Broadcast target keyword (case-sensitive).
pub const PUBLIC: &str = "PUBLIC";

/// Separator between line fields.
pub const FIELD_SEP: char = '!';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("line needs at least two '!' separators")]
    MissingSeparator,
}

/// A parsed application line, borrowing from the envelope's `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLine<'a> {
    pub from: &'a str,
    /// A nick, or [`PUBLIC`]. Shape is not checked here.
    pub to: &'a str,
    pub remainder: &'a str,
}

impl<'a> AppLine<'a> {
    pub fn parse(line: &'a str) -> Result<Self, LineError> {
        let mut fields = line.splitn(3, FIELD_SEP);
        let from = fields.next().ok_or(LineError::MissingSeparator)?;
        let to = fields.next().ok_or(LineError::MissingSeparator)?;
        let remainder = fields.next().ok_or(LineError::MissingSeparator)?;
        Ok(Self {
            from,
            to,
            remainder,
        })
    }

    pub fn is_public(&self) -> bool {
        self.to == PUBLIC
    }
}

/// Build a line from its parts.
pub fn compose(from: &str, to: &str, remainder: &str) -> String {
    format!("{from}{FIELD_SEP}{to}{FIELD_SEP}{remainder}")
}
