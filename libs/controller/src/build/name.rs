/// Budget for a build name. Shorter than the 63-character DNS label limit
/// so suffixed resource names (`<name>-initialize`, `<name>-cleanup`) still
/// fit it.
const NAME_BUDGET: usize = 50;

/// Number of commit characters kept in the build name.
const COMMIT_LEN: usize = 8;

/// Reduce an arbitrary string to a DNS-label-safe slug: lowercase ASCII
/// alphanumerics with single dashes, no leading or trailing dash.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Deterministic build name for `(repo, target_branch, pr?, commit)`.
///
/// The commit part always survives truncation so names for distinct
/// commits never collide; the repo/branch prefix is cut to fit the budget.
/// The exact tuple is recoverable from the workload annotations.
pub fn build_name(repo: &str, target_branch: &str, pr: Option<u64>, commit: &str) -> String {
    let mid = match pr {
        Some(pr) => format!("pr{pr}"),
        None => slugify(target_branch),
    };
    let commit_part: String = commit.chars().take(COMMIT_LEN).collect::<String>().to_lowercase();

    let mut prefix = format!("{}-{}", slugify(repo), mid);
    let budget = NAME_BUDGET - COMMIT_LEN - 1;
    if prefix.len() > budget {
        prefix.truncate(budget);
        while prefix.ends_with('-') {
            prefix.pop();
        }
    }
    format!("{prefix}-{commit_part}")
}
