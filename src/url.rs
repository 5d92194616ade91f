//! URL and filesystem path normalization
//!
//! Accepts URLs as well as absolute or relative POSIX and Windows paths.
//! Anything without a scheme is treated as a `file://` URL. The value is
//! computed once at construction and never mutated afterwards.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

static DRIVE_RE: OnceLock<Regex> = OnceLock::new();
static SCHEME_RE: OnceLock<Regex> = OnceLock::new();

fn drive_re() -> &'static Regex {
    DRIVE_RE.get_or_init(|| Regex::new(r"(?i)^(?:file://)?([a-z]):/").unwrap())
}

fn scheme_re() -> &'static Regex {
    SCHEME_RE.get_or_init(|| Regex::new(r"(?i)^([a-z][a-z0-9+.\-]*)://").unwrap())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("{0} is not a valid URL")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: Option<String>,
    user: Option<String>,
    pass: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    drive: Option<char>,
    query: Option<String>,
    fragment: Option<String>,
    path_parts: Vec<String>,
    is_absolute: bool,
    is_non_root_directory: bool,
}

/// Raw pieces of a URL before path processing
#[derive(Debug, Default)]
struct Components {
    scheme: Option<String>,
    user: Option<String>,
    pass: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Url {
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let normalized = raw.replace('\\', "/");

        let drive = match drive_re().captures(&normalized) {
            // `C://` is not a drive letter
            Some(caps) if !normalized[caps[0].len()..].starts_with('/') => {
                caps[1].chars().next().map(|c| c.to_ascii_uppercase())
            }
            _ => None,
        };

        // `//host/path` is scheme-relative; anything else without a scheme is a file
        let scheme_relative = normalized.starts_with("//") && !normalized.starts_with("///");
        let url = if scheme_re().is_match(&normalized) || scheme_relative {
            normalized
        } else {
            format!("file://{}", normalized)
        };

        let mut components = split_components(&url)?;

        // File URLs have no host. What was parsed as one is either the first
        // segment of a relative path or the drive letter.
        if is_file_scheme(components.scheme.as_deref()) {
            if let Some(host) = components.host.take() {
                if drive.is_none() {
                    components.path = format!("{}{}", host, components.path);
                }
            }
        }

        Ok(Self::process_path(components, drive))
    }

    fn process_path(components: Components, drive: Option<char>) -> Self {
        let path = components.path.as_str();
        let is_absolute = path.starts_with('/') || components.host.is_some();
        let is_non_root_directory = path.ends_with('/') && path.len() > 1;

        let mut parts: Vec<String> = Vec::new();
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }

            let is_traversal = segment.to_ascii_lowercase().replace("%2e", ".") == "..";
            if !is_traversal {
                parts.push(segment.to_string());
                continue;
            }

            match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                // Nothing above the root
                _ if is_absolute => {}
                // Leading traversals of a relative path stay
                _ => parts.push("..".to_string()),
            }
        }

        Self {
            scheme: components.scheme,
            user: components.user,
            pass: components.pass,
            host: components.host,
            port: components.port,
            drive,
            query: components.query,
            fragment: components.fragment,
            path_parts: parts,
            is_absolute,
            is_non_root_directory,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }

    pub fn is_relative(&self) -> bool {
        !self.is_absolute
    }

    pub fn is_file(&self) -> bool {
        is_file_scheme(self.scheme.as_deref())
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn drive(&self) -> Option<char> {
        self.drive
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// The normalized path, with the drive letter restored when present.
    pub fn path(&self) -> String {
        self.with_drive(&join_path(
            &self.path_parts,
            self.is_absolute,
            self.is_non_root_directory,
        ))
    }

    /// The URL of the directory `level` levels up (`level < 1` is treated
    /// as 1).
    ///
    /// Absolute URLs and paths cannot climb above their root and return
    /// `None` once `level` exceeds the path depth. Relative file paths have
    /// no fixed root, so they keep growing `../` segments instead.
    pub fn parent_url(&self, level: usize) -> Option<String> {
        let level = level.max(1);
        let depth = self.path_parts.len();

        let parent_parts: Vec<String> = if self.is_absolute {
            if level > depth {
                return None;
            }
            self.path_parts[..depth - level].to_vec()
        } else {
            let leading = self.path_parts.iter().take_while(|p| *p == "..").count();
            let named = depth - leading;
            if level <= named {
                self.path_parts[..depth - level].to_vec()
            } else {
                vec!["..".to_string(); leading + (level - named)]
            }
        };

        let path = self.with_drive(&join_path(&parent_parts, self.is_absolute, true));
        Some(self.render(&path, None, None))
    }

    /// Every ancestor, nearest first, up to the root.
    ///
    /// A relative path starting with `..` has no knowable top, so only its
    /// immediate parent is returned.
    pub fn all_parent_urls(&self) -> Vec<String> {
        let mut max_level = self.path_parts.len();
        if self.is_relative() && self.path_parts.first().is_some_and(|p| p == "..") {
            max_level = 1;
        }
        (1..=max_level).filter_map(|level| self.parent_url(level)).collect()
    }

    fn with_drive(&self, path: &str) -> String {
        match self.drive {
            Some(d) => format!("{}:{}", d, path),
            None => path.to_string(),
        }
    }

    fn render(&self, path: &str, query: Option<&str>, fragment: Option<&str>) -> String {
        let mut out = String::new();
        match &self.scheme {
            Some(scheme) => {
                out.push_str(scheme);
                out.push_str("://");
            }
            None => out.push_str("//"),
        }

        let user = self.user.as_deref().unwrap_or("");
        let pass = self.pass.as_deref().map(|p| format!(":{}", p)).unwrap_or_default();
        if !user.is_empty() || !pass.is_empty() {
            out.push_str(user);
            out.push_str(&pass);
            out.push('@');
        }

        let host = self.host.as_deref().unwrap_or("");
        out.push_str(host);
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }

        if host.is_empty() && (path.is_empty() || path == ".") {
            out.push_str("./");
        } else {
            out.push_str(path);
        }

        if let Some(q) = query {
            out.push('?');
            out.push_str(q);
        }
        if let Some(f) = fragment {
            out.push('#');
            out.push_str(f);
        }
        out
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path();
        f.write_str(&self.render(&path, self.query.as_deref(), self.fragment.as_deref()))
    }
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Url {
    type Error = UrlError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

fn is_file_scheme(scheme: Option<&str>) -> bool {
    scheme.is_some_and(|s| s.eq_ignore_ascii_case("file"))
}

fn join_path(parts: &[String], absolute: bool, trailing_slash: bool) -> String {
    if parts.is_empty() {
        return if absolute { "/".to_string() } else { "./".to_string() };
    }
    let mut path = String::new();
    if absolute {
        path.push('/');
    }
    path.push_str(&parts.join("/"));
    if trailing_slash {
        path.push('/');
    }
    path
}

fn split_components(url: &str) -> Result<Components, UrlError> {
    let malformed = || UrlError::Malformed(url.to_string());
    let mut c = Components::default();

    let (rest, fragment) = match url.split_once('#') {
        Some((r, f)) => (r, Some(f.to_string())),
        None => (url, None),
    };
    c.fragment = fragment;

    let (rest, query) = match rest.split_once('?') {
        Some((r, q)) => (r, Some(q.to_string())),
        None => (rest, None),
    };
    c.query = query;

    let after_scheme = match rest.strip_prefix("//") {
        Some(r) => r,
        None => {
            let (scheme, r) = rest.split_once("://").ok_or_else(malformed)?;
            c.scheme = Some(scheme.to_string());
            r
        }
    };

    let (authority, path) = match after_scheme.find('/') {
        Some(idx) => after_scheme.split_at(idx),
        None => (after_scheme, ""),
    };
    c.path = path.to_string();

    if is_file_scheme(c.scheme.as_deref()) {
        // Kept whole; the caller folds it back into the path
        if !authority.is_empty() {
            c.host = Some(authority.to_string());
        }
        return Ok(c);
    }

    let host_port = match authority.rsplit_once('@') {
        Some((userinfo, hp)) => {
            match userinfo.split_once(':') {
                Some((u, p)) => {
                    c.user = Some(u.to_string());
                    c.pass = Some(p.to_string());
                }
                None => c.user = Some(userinfo.to_string()),
            }
            hp
        }
        None => authority,
    };

    let (host, port) = if host_port.starts_with('[') {
        // IPv6 literal
        let end = host_port.find(']').ok_or_else(malformed)?;
        let (h, tail) = host_port.split_at(end + 1);
        match tail {
            "" => (h, None),
            t => (h, Some(t.strip_prefix(':').ok_or_else(malformed)?)),
        }
    } else {
        match host_port.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (host_port, None),
        }
    };

    if host.is_empty() {
        return Err(malformed());
    }
    c.host = Some(host.to_string());

    c.port = match port {
        None | Some("") => None,
        Some(p) if p.bytes().all(|b| b.is_ascii_digit()) => {
            Some(p.parse::<u16>().map_err(|_| malformed())?)
        }
        Some(_) => return Err(malformed()),
    };

    Ok(c)
}
