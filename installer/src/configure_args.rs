//! Typed handling of the host binary's `configure` arguments.
//!
//! The arguments printed by `nginx -V` are re-used verbatim for the module
//! build so the module matches the running binary. They are parsed into
//! [`ConfigureArg`] values, filtered, extended with the module directive and
//! rendered back to one argv element each.

use crate::error::{InstallerError, Result};
use camino::Utf8Path;
use std::fmt;

/// Options that must not be re-applied to a standalone module build.
pub const STRIPPED_OPTIONS: [&str; 3] = ["--prefix", "--add-module", "--add-dynamic-module"];

/// Option that makes dynamic modules loadable across builds of one version.
pub const COMPAT_FLAG: &str = "--with-compat";

/// One `configure` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureArg {
    /// `--name`
    Flag(String),
    /// `--name=value`; the value is unquoted.
    KeyValue(String, String),
}

impl ConfigureArg {
    /// Option name including the leading dashes.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Flag(name) | Self::KeyValue(name, _) => name,
        }
    }

    fn from_token(token: String) -> Result<Self> {
        if !token.starts_with("--") || token.len() == 2 {
            return Err(unavailable(format!("unexpected argument `{token}`")));
        }
        Ok(match token.split_once('=') {
            Some((name, value)) => Self::KeyValue(name.to_owned(), value.to_owned()),
            None => Self::Flag(token),
        })
    }
}

impl fmt::Display for ConfigureArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(name) => f.write_str(name),
            Self::KeyValue(name, value) => write!(f, "{name}={value}"),
        }
    }
}

/// Parse a raw `configure arguments:` value.
///
/// Single and double quotes group text containing spaces; a backslash
/// escapes the next character outside single quotes.
///
/// # Errors
///
/// Returns [`InstallerError::HostConfigUnavailable`] for an empty string, an
/// unterminated quote, or a token that is not a `--` option.
///
/// # Examples
///
/// ```
/// use modsec_installer::configure_args::{ConfigureArg, parse_configure_args};
///
/// let args = parse_configure_args("--with-compat --with-cc-opt='-O2 -g'")?;
/// assert_eq!(args, [
///     ConfigureArg::Flag("--with-compat".to_owned()),
///     ConfigureArg::KeyValue("--with-cc-opt".to_owned(), "-O2 -g".to_owned()),
/// ]);
/// # Ok::<(), modsec_installer::error::InstallerError>(())
/// ```
pub fn parse_configure_args(raw: &str) -> Result<Vec<ConfigureArg>> {
    let tokens = tokenize(raw)?;
    if tokens.is_empty() {
        return Err(unavailable("the host reported no configure arguments".to_owned()));
    }
    tokens.into_iter().map(ConfigureArg::from_token).collect()
}

fn tokenize(raw: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"') | None, '\\') => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| unavailable("trailing backslash".to_owned()))?;
                current.push(escaped);
                in_token = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(unavailable(format!("unterminated {q} quote")));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unavailable(reason: String) -> InstallerError {
    InstallerError::HostConfigUnavailable { reason }
}

/// Arguments for building a dynamic module from `module_source` against the
/// host configuration `host_args`.
///
/// Installation prefix and module directives are dropped and a single
/// `--add-dynamic-module` is appended.
#[must_use]
pub fn module_build_args(host_args: &[ConfigureArg], module_source: &Utf8Path) -> Vec<ConfigureArg> {
    host_args
        .iter()
        .filter(|arg| !STRIPPED_OPTIONS.contains(&arg.name()))
        .cloned()
        .chain(std::iter::once(ConfigureArg::KeyValue(
            "--add-dynamic-module".to_owned(),
            module_source.to_string(),
        )))
        .collect()
}

/// Whether `args` contains `name`.
#[must_use]
pub fn has_option(args: &[ConfigureArg], name: &str) -> bool {
    args.iter().any(|arg| arg.name() == name)
}

/// Value of the first `name=value` option in `args`.
#[must_use]
pub fn option_value<'a>(args: &'a [ConfigureArg], name: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| match arg {
        ConfigureArg::KeyValue(n, value) if n == name => Some(value.as_str()),
        _ => None,
    })
}

/// Render `args` as argv elements.
#[must_use]
pub fn render_args(args: &[ConfigureArg]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}
