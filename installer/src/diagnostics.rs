//! Classification of native build output into actionable diagnostics.
//!
//! Compiler and configure-script failures are noisy. This module picks out
//! the few patterns a human can act on (a missing header, a missing library,
//! an unresolved symbol) and maps them to the development package that
//! provides them on the detected distribution.

use crate::environment::PackageFamily;
use crate::exec::tail_lines;
use std::fmt;

/// Number of output lines kept when nothing recognisable is found.
pub const RAW_TAIL_LINES: usize = 20;

/// `(keyword, rhel package, debian package)`; first keyword match wins.
const PACKAGES: &[(&str, &str, &str)] = &[
    ("pcre2", "pcre2-devel", "libpcre2-dev"),
    ("pcre", "pcre-devel", "libpcre3-dev"),
    ("xml", "libxml2-devel", "libxml2-dev"),
    ("curl", "curl-devel", "libcurl4-openssl-dev"),
    ("yajl", "yajl-devel", "libyajl-dev"),
    ("lmdb", "lmdb-devel", "liblmdb-dev"),
    ("maxmind", "libmaxminddb-devel", "libmaxminddb-dev"),
    ("geoip", "GeoIP-devel", "libgeoip-dev"),
    ("lua", "lua-devel", "liblua5.2-dev"),
    ("zlib", "zlib-devel", "zlib1g-dev"),
    ("ssl", "openssl-devel", "libssl-dev"),
    ("crypto", "openssl-devel", "libssl-dev"),
];

/// One finding extracted from build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A header could not be included.
    MissingHeader {
        /// Header as written in the include (e.g. `libxml/parser.h`).
        header: String,
        /// Package that provides it, when known.
        package: Option<String>,
    },
    /// The linker could not find `-l<library>`.
    MissingLibrary {
        /// Library name without the `-l` prefix.
        library: String,
        /// Package that provides it, when known.
        package: Option<String>,
    },
    /// A `configure: error:` line.
    ConfigureCheck {
        /// The configure script's message.
        message: String,
        /// Package that likely satisfies the check, when known.
        package: Option<String>,
    },
    /// The linker could not resolve a symbol.
    UndefinedReference {
        /// Symbol name.
        symbol: String,
    },
    /// Nothing recognisable; the tail of the output.
    Unclassified {
        /// Last lines of combined output.
        tail: String,
    },
}

impl Diagnostic {
    /// Package suggested to fix this finding.
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::MissingHeader { package, .. }
            | Self::MissingLibrary { package, .. }
            | Self::ConfigureCheck { package, .. } => package.as_deref(),
            Self::UndefinedReference { .. } | Self::Unclassified { .. } => None,
        }
    }

    /// Whether this finding names a missing prerequisite.
    #[must_use]
    pub const fn is_missing_dependency(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader { .. } | Self::MissingLibrary { .. } | Self::ConfigureCheck { .. }
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeader { header, .. } => write!(f, "missing header {header}")?,
            Self::MissingLibrary { library, .. } => write!(f, "missing library -l{library}")?,
            Self::ConfigureCheck { message, .. } => write!(f, "configure check failed: {message}")?,
            Self::UndefinedReference { symbol } => write!(f, "undefined reference to {symbol}")?,
            Self::Unclassified { tail } => {
                f.write_str("output tail:")?;
                for line in tail.lines() {
                    write!(f, "\n      {line}")?;
                }
            }
        }
        if let Some(package) = self.package() {
            write!(f, " (provided by {package})")?;
        }
        Ok(())
    }
}

/// Development package providing `name` (a header, library, or configure
/// message) on `family`.
///
/// # Examples
///
/// ```
/// use modsec_installer::diagnostics::package_for;
/// use modsec_installer::environment::PackageFamily;
///
/// assert_eq!(package_for("pcre.h", PackageFamily::Rhel), Some("pcre-devel"));
/// assert_eq!(package_for("yajl", PackageFamily::Debian), Some("libyajl-dev"));
/// assert_eq!(package_for("pcre.h", PackageFamily::Unknown), None);
/// ```
#[must_use]
pub fn package_for(name: &str, family: PackageFamily) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    let key = if lower == "z" { "zlib" } else { lower.as_str() };
    let &(_, rhel, debian) = PACKAGES.iter().find(|(keyword, _, _)| key.contains(keyword))?;
    match family {
        PackageFamily::Rhel => Some(rhel),
        PackageFamily::Debian => Some(debian),
        PackageFamily::Unknown => None,
    }
}

/// Extract diagnostics from build output.
///
/// Always returns at least one entry: when no pattern matches, the output
/// tail is returned as [`Diagnostic::Unclassified`].
#[must_use]
pub fn classify(output: &str, family: PackageFamily) -> Vec<Diagnostic> {
    let suggest = |name: &str| package_for(name, family).map(str::to_owned);
    let mut found: Vec<Diagnostic> = Vec::new();
    for line in output.lines() {
        let diagnostic = if let Some(header) = missing_header(line) {
            Diagnostic::MissingHeader {
                package: suggest(&header),
                header,
            }
        } else if let Some(library) = missing_library(line) {
            Diagnostic::MissingLibrary {
                package: suggest(&library),
                library,
            }
        } else if let Some(message) = line.split_once("configure: error:").map(|(_, m)| m.trim())
        {
            Diagnostic::ConfigureCheck {
                package: suggest(message),
                message: message.to_owned(),
            }
        } else if let Some(symbol) = undefined_reference(line) {
            Diagnostic::UndefinedReference { symbol }
        } else {
            continue;
        };
        if !found.contains(&diagnostic) {
            found.push(diagnostic);
        }
    }
    if found.is_empty() {
        found.push(Diagnostic::Unclassified {
            tail: tail_lines(output, RAW_TAIL_LINES),
        });
    }
    found
}

/// Distinct packages suggested by `diagnostics`, in first-seen order.
#[must_use]
pub fn suggested_packages(diagnostics: &[Diagnostic]) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for package in diagnostics.iter().filter_map(Diagnostic::package) {
        if !packages.iter().any(|p| p == package) {
            packages.push(package.to_owned());
        }
    }
    packages
}

fn missing_header(line: &str) -> Option<String> {
    let (before, _) = line.split_once(": No such file")?;
    let header = before
        .rsplit(|c: char| c.is_whitespace() || c == ':')
        .next()?
        .trim_matches(|c| c == '\'' || c == '"' || c == '<' || c == '>');
    let is_header = header
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && matches!(ext, "h" | "hh" | "hpp"));
    is_header.then(|| header.to_owned())
}

fn missing_library(line: &str) -> Option<String> {
    let (_, rest) = line.split_once("cannot find -l")?;
    let library: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ':')
        .collect();
    (!library.is_empty()).then_some(library)
}

fn undefined_reference(line: &str) -> Option<String> {
    let (_, rest) = line.split_once("undefined reference to ")?;
    let symbol = rest
        .trim()
        .trim_matches(|c| matches!(c, '`' | '\'' | '‘' | '’' | '"'));
    (!symbol.is_empty()).then(|| symbol.to_owned())
}
