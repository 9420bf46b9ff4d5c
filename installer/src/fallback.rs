//! Ordered "first success" combinator.
//!
//! Candidates are tried strictly in order. The first success wins and carries
//! the failures that preceded it; if every candidate fails, the caller gets
//! the full list of per-attempt failures.

use std::fmt;

/// One failed attempt, labelled with the candidate it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Human-readable label of the candidate (for mirrors, the URL).
    pub origin: String,
    /// Why it failed.
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.reason)
    }
}

/// The winning candidate's value plus the failures tried before it.
#[derive(Debug)]
pub struct Found<T> {
    /// Value produced by the first successful candidate.
    pub value: T,
    /// Zero-based index of that candidate.
    pub index: usize,
    /// Failures of every earlier candidate, in order.
    pub failures: Vec<AttemptFailure>,
}

/// Try each candidate in order until one succeeds.
///
/// # Errors
///
/// Returns every candidate's failure, in order, when none succeeds. An empty
/// candidate list yields an empty failure list.
///
/// # Examples
///
/// ```
/// use modsec_installer::fallback::first_success;
///
/// let found = first_success(
///     ["a", "b", "c"],
///     |c| (*c).to_owned(),
///     |c| if *c == "b" { Ok(2) } else { Err("down") },
/// )
/// .expect("b succeeds");
/// assert_eq!(found.value, 2);
/// assert_eq!(found.index, 1);
/// assert_eq!(found.failures.len(), 1);
/// ```
pub fn first_success<C, T, E, L, A>(
    candidates: impl IntoIterator<Item = C>,
    mut label: L,
    mut attempt: A,
) -> Result<Found<T>, Vec<AttemptFailure>>
where
    E: fmt::Display,
    L: FnMut(&C) -> String,
    A: FnMut(&C) -> Result<T, E>,
{
    let mut failures = Vec::new();
    for (index, candidate) in candidates.into_iter().enumerate() {
        match attempt(&candidate) {
            Ok(value) => {
                return Ok(Found {
                    value,
                    index,
                    failures,
                });
            }
            Err(err) => failures.push(AttemptFailure {
                origin: label(&candidate),
                reason: err.to_string(),
            }),
        }
    }
    Err(failures)
}

/// Render failures as an indented, one-per-line list.
#[must_use]
pub fn render_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("\n  - {f}"))
        .collect::<String>()
}
