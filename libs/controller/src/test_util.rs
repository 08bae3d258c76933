use chrono::{DateTime, TimeZone, Utc};

use crate::build::{Build, BuildStatus, InitStatus};

/// A build in the given derived status, with raw fields chosen to match.
pub(crate) fn build(name: &str, status: BuildStatus) -> Build {
    let (init_status, desired, ready, deleted) = match status {
        BuildStatus::Todo => (InitStatus::Todo, 0, 0, false),
        BuildStatus::Initializing => (InitStatus::Started, 0, 0, false),
        BuildStatus::Failed => (InitStatus::Failed, 0, 0, false),
        BuildStatus::Stopped => (InitStatus::Succeeded, 0, 0, false),
        BuildStatus::Starting => (InitStatus::Succeeded, 1, 0, false),
        BuildStatus::Started => (InitStatus::Succeeded, 1, 1, false),
        BuildStatus::Cleaning => (InitStatus::Succeeded, 0, 0, true),
    };
    Build {
        name: name.into(),
        repo: "acme/svc".into(),
        target_branch: "main".into(),
        pr: None,
        git_commit: "0123456789abcdef0123456789abcdef01234567".into(),
        image: "img:1".into(),
        created_at: at(0),
        init_status,
        init_status_timestamp: at(0),
        desired_replicas: desired,
        ready_replicas: ready,
        deleted,
        last_scaled_at: at(0),
        status,
    }
}

/// A fixed timestamp `hours` into the test day, for ordering assertions.
pub(crate) fn at(hours: u32) -> Option<DateTime<Utc>> {
    Some(Utc.with_ymd_and_hms(2024, 5, 1, hours, 0, 0).unwrap())
}
