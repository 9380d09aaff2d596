//! Semantic versions and npm-style version requirements.
//!
//! Used in two places: the class registry picks the newest registered module
//! version satisfying a model's `_model_module_version`, and the version
//! handshake checks our front-end version against the remote requirement.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WidgetError};

/// A `major.minor.patch[-pre]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre_release: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = WidgetError;

    fn from_str(s: &str) -> Result<Self> {
        let partial = Partial::parse(s)?;
        match partial {
            Partial {
                major: Some(major),
                minor: Some(minor),
                patch: Some(patch),
                pre_release,
            } => Ok(Self {
                major,
                minor,
                patch,
                pre_release,
            }),
            _ => Err(WidgetError::InvalidArgument(format!(
                "incomplete version: {:?}",
                s
            ))),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A pre-release sorts before the release it precedes.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

// ---------------------------------------------------------------------------
// Partial versions
// ---------------------------------------------------------------------------

/// A version with optional trailing components (`2`, `2.1`, `2.x`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre_release: Option<String>,
}

impl Partial {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let s = s.split_once('+').map(|(v, _build)| v).unwrap_or(s);
        let (core, pre_release) = match s.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (s, None),
        };

        let mut parts = core.split('.');
        let mut next = || -> Result<Option<u64>> {
            match parts.next() {
                None | Some("x") | Some("X") | Some("*") => Ok(None),
                Some(digits) => digits.parse().map(Some).map_err(|_| {
                    WidgetError::InvalidArgument(format!("invalid version component {:?} in {:?}", digits, s))
                }),
            }
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() {
            return Err(WidgetError::InvalidArgument(format!("too many components in {:?}", s)));
        }

        Ok(Self {
            major,
            minor: major.and(minor),
            patch: major.and(minor).and(patch),
            pre_release,
        })
    }

    fn floor(&self) -> Version {
        Version {
            major: self.major.unwrap_or(0),
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            pre_release: self.pre_release.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

/// One comparator, desugared into a half-open interval.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Range {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl Range {
    fn any() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    fn between(lower: Version, upper: Version) -> Self {
        Self {
            lower: Some(Bound {
                version: lower,
                inclusive: true,
            }),
            upper: Some(Bound {
                version: upper,
                inclusive: false,
            }),
        }
    }

    fn matches(&self, v: &Version) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) if b.inclusive => v >= &b.version,
            Some(b) => v > &b.version,
        };
        let below = match &self.upper {
            None => true,
            Some(b) if b.inclusive => v <= &b.version,
            Some(b) => v < &b.version,
        };
        above && below
    }

    /// The range a bare partial covers: `2` is `>=2.0.0 <3.0.0`.
    fn wildcard(p: &Partial) -> Self {
        match (p.major, p.minor, p.patch) {
            (None, _, _) => Range::any(),
            (Some(ma), None, _) => Range::between(Version::new(ma, 0, 0), Version::new(ma + 1, 0, 0)),
            (Some(ma), Some(mi), None) => {
                Range::between(Version::new(ma, mi, 0), Version::new(ma, mi + 1, 0))
            }
            (Some(_), Some(_), Some(_)) => Range {
                lower: Some(Bound {
                    version: p.floor(),
                    inclusive: true,
                }),
                upper: Some(Bound {
                    version: p.floor(),
                    inclusive: true,
                }),
            },
        }
    }

    fn caret(p: &Partial) -> Self {
        let floor = p.floor();
        let upper = match (p.major, p.minor, p.patch) {
            (None, _, _) => return Range::any(),
            (Some(ma), _, _) if ma > 0 => Version::new(ma + 1, 0, 0),
            (Some(0), None, _) => Version::new(1, 0, 0),
            (Some(0), Some(mi), _) if mi > 0 => Version::new(0, mi + 1, 0),
            (Some(0), Some(0), None) => Version::new(0, 1, 0),
            (Some(0), Some(0), Some(pa)) => Version::new(0, 0, pa + 1),
            _ => return Range::wildcard(p),
        };
        Range::between(floor, upper)
    }

    fn tilde(p: &Partial) -> Self {
        match (p.major, p.minor) {
            (None, _) => Range::any(),
            (Some(ma), None) => Range::between(p.floor(), Version::new(ma + 1, 0, 0)),
            (Some(ma), Some(mi)) => Range::between(p.floor(), Version::new(ma, mi + 1, 0)),
        }
    }

    fn parse(token: &str) -> Result<Self> {
        let (op, rest) = split_operator(token);
        let p = Partial::parse(rest)?;
        let bound = |inclusive| Bound {
            version: p.floor(),
            inclusive,
        };
        Ok(match op {
            "" | "=" => Range::wildcard(&p),
            "^" => Range::caret(&p),
            "~" | "~>" => Range::tilde(&p),
            ">=" => Range {
                lower: Some(bound(true)),
                upper: None,
            },
            ">" => match p.major {
                None => Range::any(),
                // `>2` means `>=3.0.0`, `>2.1` means `>=2.2.0`.
                Some(_) if p.minor.is_none() || p.patch.is_none() => {
                    let Range { upper, .. } = Range::wildcard(&p);
                    Range {
                        lower: upper.map(|b| Bound {
                            version: b.version,
                            inclusive: true,
                        }),
                        upper: None,
                    }
                }
                Some(_) => Range {
                    lower: Some(bound(false)),
                    upper: None,
                },
            },
            "<" => Range {
                lower: None,
                upper: Some(bound(false)),
            },
            "<=" => match p.major {
                None => Range::any(),
                Some(_) if p.minor.is_none() || p.patch.is_none() => {
                    let Range { upper, .. } = Range::wildcard(&p);
                    Range { lower: None, upper }
                }
                Some(_) => Range {
                    lower: None,
                    upper: Some(bound(true)),
                },
            },
            other => {
                return Err(WidgetError::InvalidArgument(format!(
                    "unknown version operator {:?}",
                    other
                )))
            }
        })
    }
}

fn split_operator(token: &str) -> (&str, &str) {
    for op in [">=", "<=", "~>", ">", "<", "=", "^", "~"] {
        if let Some(rest) = token.strip_prefix(op) {
            return (op, rest.trim_start());
        }
    }
    ("", token)
}

/// A requirement such as `^2.0.0`, `~1.2`, `>=1.0 <3`, or `1.x || 2.x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    /// Alternatives joined by `||`; each alternative is a conjunction.
    alternatives: Vec<Vec<Range>>,
    source: String,
}

impl VersionReq {
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|set| set.iter().all(|range| range.matches(version)))
    }

    /// Pick the highest version satisfying this requirement.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        versions.into_iter().filter(|v| self.matches(v)).max()
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for VersionReq {
    type Err = WidgetError;

    fn from_str(s: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for alternative in s.split("||") {
            let mut ranges = Vec::new();
            let mut tokens = alternative.split_whitespace().peekable();
            while let Some(token) = tokens.next() {
                // Allow a space between operator and version: `>= 1.2`.
                if matches!(token, ">=" | "<=" | ">" | "<" | "=" | "^" | "~") {
                    let version = tokens.next().ok_or_else(|| {
                        WidgetError::InvalidArgument(format!("dangling operator in {:?}", s))
                    })?;
                    ranges.push(Range::parse(&format!("{}{}", token, version))?);
                } else {
                    ranges.push(Range::parse(token)?);
                }
            }
            if ranges.is_empty() {
                ranges.push(Range::any());
            }
            alternatives.push(ranges);
        }
        Ok(Self {
            alternatives,
            source: s.trim().to_string(),
        })
    }
}

/// Check whether `version` satisfies `requirement`.
pub fn satisfies(version: &str, requirement: &str) -> Result<bool> {
    let version: Version = version.parse()?;
    let requirement: VersionReq = requirement.parse()?;
    Ok(requirement.matches(&version))
}
