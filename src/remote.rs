use std::net::TcpStream;

use anyhow::Context as _;
use base64::engine::general_purpose::NO_PAD;
use base64::engine::GeneralPurpose;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, Utc};
use imap::types::Flag;
use log::{debug, info};
use native_tls::{TlsConnector, TlsStream};

use crate::transport::{Result, SourceMessage, Transport, TransportError};

type Session = imap::Session<TlsStream<TcpStream>>;

// Base64 variant used by RFC 3501 modified UTF-7: ',' instead of '/',
// no padding.
const MUTF7: GeneralPurpose = GeneralPurpose::new(&base64::alphabet::IMAP_MUTF7, NO_PAD);

const FETCH_QUERY: &str = "(FLAGS INTERNALDATE RFC822)";

/// Connection settings for one account, taken from the environment so the
/// core never sees credentials in its configuration.
#[derive(Clone)]
pub struct Account {
    pub server: String,
    pub email: String,
    pub password: String,
}

impl Account {
    /// Reads `<prefix>_IMAP_SERVER`, `<prefix>_EMAIL` and
    /// `<prefix>_PASSWORD` from the environment.
    pub fn from_env(prefix: &str) -> anyhow::Result<Self> {
        let var = |name: &str| {
            let key = format!("{}_{}", prefix, name);
            std::env::var(&key).with_context(|| format!("missing environment variable {}", key))
        };
        Ok(Account {
            server: var("IMAP_SERVER")?,
            email: var("EMAIL")?,
            password: var("PASSWORD")?,
        })
    }
}

/// IMAP-backed message store. Source connections select folders read-only
/// (EXAMINE) so a migration can never mutate the source account.
pub struct ImapTransport {
    account: Account,
    readonly: bool,
    session: Session,
    selected: Option<String>,
}

impl ImapTransport {
    pub fn connect(account: Account, readonly: bool) -> Result<Self> {
        info!("login to {}...", account.server);
        let session = connect_session(&account)?;
        Ok(ImapTransport {
            account,
            readonly,
            session,
            selected: None,
        })
    }

}

impl Drop for ImapTransport {
    fn drop(&mut self) {
        // Failure here is harmless, the connection is going away anyway.
        if let Err(err) = self.session.logout() {
            debug!("logout from {} failed: {}", self.account.server, err);
        }
    }
}

fn host_port(server: &str) -> (&str, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (server, 993),
        },
        None => (server, 993),
    }
}

fn connect_session(account: &Account) -> Result<Session> {
    let tls = TlsConnector::builder()
        .build()
        .map_err(|err| TransportError::Permanent(format!("TLS setup failed: {}", err)))?;
    let (host, port) = host_port(&account.server);
    let client = imap::connect((host, port), host, &tls).map_err(map_error)?;
    client
        .login(&account.email, &account.password)
        .map_err(|(err, _)| {
            TransportError::Permanent(format!("login to {} rejected: {}", account.server, err))
        })
}

fn map_error(err: imap::Error) -> TransportError {
    match err {
        imap::Error::Io(err) => TransportError::Transient(err.to_string()),
        imap::Error::ConnectionLost => TransportError::Transient("connection lost".to_string()),
        imap::Error::Tls(err) => TransportError::Transient(err.to_string()),
        imap::Error::TlsHandshake(err) => TransportError::Transient(err.to_string()),
        imap::Error::Parse(err) => TransportError::Malformed(err.to_string()),
        other => TransportError::Permanent(other.to_string()),
    }
}

fn flag_to_string(flag: &Flag) -> Option<String> {
    match flag {
        Flag::Seen => Some("\\Seen".to_string()),
        Flag::Answered => Some("\\Answered".to_string()),
        Flag::Flagged => Some("\\Flagged".to_string()),
        Flag::Deleted => Some("\\Deleted".to_string()),
        Flag::Draft => Some("\\Draft".to_string()),
        Flag::Custom(name) => Some(name.to_string()),
        // \Recent and the permanent-flag wildcard cannot be set on APPEND.
        _ => None,
    }
}

/// Encodes a folder name as IMAP modified UTF-7 (RFC 3501 §5.1.3).
/// Printable ASCII passes through, `&` becomes `&-`, everything else is
/// shifted into `&<base64 of UTF-16BE>-` runs.
fn encode_folder(name: &str) -> String {
    fn flush(out: &mut String, pending: &mut Vec<u8>) {
        if !pending.is_empty() {
            out.push('&');
            out.push_str(&MUTF7.encode(&pending));
            out.push('-');
            pending.clear();
        }
    }
    let mut out = String::new();
    let mut pending: Vec<u8> = Vec::new();
    for c in name.chars() {
        if (' '..='~').contains(&c) {
            flush(&mut out, &mut pending);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut buf = [0u16; 2];
            for unit in c.encode_utf16(&mut buf) {
                pending.extend_from_slice(&unit.to_be_bytes());
            }
        }
    }
    flush(&mut out, &mut pending);
    out
}

/// Decodes an IMAP modified UTF-7 folder name. Sequences that do not
/// decode cleanly are kept verbatim so a server quirk never loses a
/// folder name.
fn decode_folder(name: &str) -> String {
    let mut out = String::new();
    let mut rest = name;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        match rest.find('-') {
            Some(end) => {
                let segment = &rest[..end];
                rest = &rest[end + 1..];
                if segment.is_empty() {
                    out.push('&');
                } else if let Some(decoded) = decode_segment(segment) {
                    out.push_str(&decoded);
                } else {
                    out.push('&');
                    out.push_str(segment);
                    out.push('-');
                }
            }
            None => {
                // Unterminated shift sequence.
                out.push('&');
                out.push_str(rest);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_segment(segment: &str) -> Option<String> {
    let bytes = MUTF7.decode(segment).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn parse_flag(name: &str) -> Flag<'static> {
    match name {
        "\\Seen" => Flag::Seen,
        "\\Answered" => Flag::Answered,
        "\\Flagged" => Flag::Flagged,
        "\\Deleted" => Flag::Deleted,
        "\\Draft" => Flag::Draft,
        other => Flag::Custom(other.to_string().into()),
    }
}

impl Transport for ImapTransport {
    /// Folder names cross this boundary in UTF-8; the modified UTF-7 the
    /// wire requires stays inside this impl.
    fn list_folders(&mut self) -> Result<Vec<String>> {
        let names = self.session.list(Some(""), Some("*")).map_err(map_error)?;
        Ok(names.iter().map(|name| decode_folder(name.name())).collect())
    }

    fn select_folder(&mut self, folder: &str) -> Result<u32> {
        let encoded = encode_folder(folder);
        let mailbox = if self.readonly {
            self.session.examine(&encoded)
        } else {
            self.session.select(&encoded)
        }
        .map_err(map_error)?;
        self.selected = Some(folder.to_string());
        Ok(mailbox.exists)
    }

    fn fetch_message(&mut self, index: u32) -> Result<SourceMessage> {
        let sequence = (index + 1).to_string();
        let fetches = self.session.fetch(&sequence, FETCH_QUERY).map_err(map_error)?;
        let fetch = fetches
            .iter()
            .next()
            .ok_or_else(|| TransportError::Malformed(format!("no data for message {}", sequence)))?;
        let body = fetch
            .body()
            .ok_or_else(|| TransportError::Malformed(format!("message {} has no body", sequence)))?
            .to_vec();
        let flags = fetch.flags().iter().filter_map(flag_to_string).collect();
        let internal_date = fetch.internal_date().unwrap_or_else(|| Utc::now().into());
        // The selected folder name is the message's label on the source.
        let labels = self.selected.iter().cloned().collect();
        Ok(SourceMessage {
            index,
            body,
            flags,
            internal_date,
            labels,
        })
    }

    fn create_folder(&mut self, folder: &str) -> Result<()> {
        let encoded = encode_folder(folder);
        match self.session.create(&encoded) {
            Ok(()) => {
                if let Err(err) = self.session.subscribe(&encoded) {
                    debug!("could not subscribe to {}: {}", folder, err);
                }
                Ok(())
            }
            Err(imap::Error::No(reason)) if reason.contains("ALREADYEXISTS") => {
                debug!("folder {} already exists", folder);
                Ok(())
            }
            Err(err) => Err(map_error(err)),
        }
    }

    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        flags: &[String],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<()> {
        let flags: Vec<Flag> = flags.iter().map(|f| parse_flag(f)).collect();
        self.session
            .append_with_flags_and_date(&encode_folder(folder), body, &flags, Some(internal_date))
            .map_err(map_error)
    }

    fn reconnect(&mut self) -> Result<()> {
        debug!("reconnecting to {}", self.account.server);
        self.session = connect_session(&self.account)?;
        self.selected = None;
        Ok(())
    }
}
