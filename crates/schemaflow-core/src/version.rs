use std::cmp::Ordering;

use crate::{UnitStatus, VersionStatus};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Number(u64),
    Text(String),
}

/// Ordering key for version labels: dotted numeric parts compare numerically
/// ("1.10.0" > "1.9.0"), anything else falls back to text comparison. A
/// pre-release suffix after `-` sorts below the bare release
/// ("1.0.0-rc1" < "1.0.0"); build metadata after `+` is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    release: Vec<Segment>,
    pre_release: Vec<Segment>,
    raw: String,
}

impl VersionKey {
    #[must_use]
    pub fn new(label: &str) -> Self {
        let trimmed = label.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let body = body.split_once('+').map_or(body, |(version, _build)| version);
        let (release, pre_release) = body.split_once('-').unwrap_or((body, ""));
        Self {
            release: segments(release),
            pre_release: segments(pre_release),
            raw: trimmed.to_string(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn segments(part: &str) -> Vec<Segment> {
    part.split(['.', '-', '_'])
        .filter(|piece| !piece.is_empty())
        .map(|piece| match piece.parse::<u64>() {
            Ok(number) => Segment::Number(number),
            Err(_) => Segment::Text(piece.to_ascii_lowercase()),
        })
        .collect()
}

impl PartialOrd for VersionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let pre_release = match (self.pre_release.is_empty(), other.pre_release.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.pre_release.cmp(&other.pre_release),
        };
        self.release
            .cmp(&other.release)
            .then(pre_release)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

/// Release status derived from member statuses.
///
/// Any failed member makes the version failed; it is completed only when every
/// member completed. A version without members is pending.
#[must_use]
pub fn aggregate_status(statuses: impl IntoIterator<Item = UnitStatus>) -> VersionStatus {
    let mut total = 0_usize;
    let mut completed = 0_usize;
    let mut progressed = false;
    for status in statuses {
        total += 1;
        match status {
            UnitStatus::Failed => return VersionStatus::Failed,
            UnitStatus::Completed => completed += 1,
            UnitStatus::Running | UnitStatus::RolledBack => progressed = true,
            UnitStatus::Pending => {}
        }
    }

    if total == 0 {
        VersionStatus::Pending
    } else if completed == total {
        VersionStatus::Completed
    } else if completed > 0 || progressed {
        VersionStatus::Partial
    } else {
        VersionStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_compare_numerically() {
        assert!(VersionKey::new("1.10.0") > VersionKey::new("1.9.3"));
        assert!(VersionKey::new("v2.0") > VersionKey::new("1.99"));
        assert_eq!(
            VersionKey::new(" 1.2 ").cmp(&VersionKey::new("1.2")),
            Ordering::Equal
        );
    }

    #[test]
    fn pre_releases_sort_below_their_release() {
        assert!(VersionKey::new("1.0.0-rc1") < VersionKey::new("1.0.0"));
        assert!(VersionKey::new("1.0.0-alpha") < VersionKey::new("1.0.0-beta"));
        assert!(VersionKey::new("1.0.0-rc.2") < VersionKey::new("1.0.0-rc.10"));
        assert!(VersionKey::new("1.0.0") < VersionKey::new("1.0.1-rc1"));
        assert!(VersionKey::new("0.9.9") < VersionKey::new("1.0.0-alpha"));
        assert_eq!(
            VersionKey::new("1.0.0+build.5").cmp(&VersionKey::new("1.0.0+build.5")),
            Ordering::Equal
        );
        assert!(VersionKey::new("1.0.0-rc1+build.7") < VersionKey::new("1.0.0+build.1"));
    }

    #[test]
    fn aggregate_status_rules() {
        use UnitStatus::{Completed, Failed, Pending, RolledBack};

        assert_eq!(aggregate_status(Vec::new()), VersionStatus::Pending);
        assert_eq!(aggregate_status([Completed, Completed]), VersionStatus::Completed);
        assert_eq!(aggregate_status([Completed, Failed]), VersionStatus::Failed);
        assert_eq!(aggregate_status([Completed, Pending]), VersionStatus::Partial);
        assert_eq!(aggregate_status([Pending, RolledBack]), VersionStatus::Partial);
        assert_eq!(aggregate_status([Pending, Pending]), VersionStatus::Pending);
    }
}
