//! PEERLIST payload: `nick;location` entries joined by `,`.

/// Separator between nick and location inside an entry.
pub const ENTRY_SEP: char = ';';
/// Separator between entries.
pub const LIST_SEP: char = ',';

/// One reachable peer as carried in a PEERLIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub nick: String,
    pub location: String,
}

pub fn format_entry(nick: &str, location: &str) -> String {
    format!("{nick}{ENTRY_SEP}{location}")
}

/// Serialize entries in the given order. No entries → empty string.
pub fn format<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    entries
        .into_iter()
        .map(|(nick, location)| format_entry(nick, location))
        .collect::<Vec<_>>()
        .join(&LIST_SEP.to_string())
}

/// Parse a PEERLIST payload. Malformed entries (no `;`, empty nick or
/// location) are skipped.
pub fn parse(line: &str) -> Vec<PeerEntry> {
    line.split(LIST_SEP)
        .filter_map(|entry| {
            let (nick, location) = entry.trim().split_once(ENTRY_SEP)?;
            if nick.is_empty() || location.is_empty() {
                return None;
            }
            Some(PeerEntry {
                nick: nick.to_string(),
                location: location.to_string(),
            })
        })
        .collect()
}
