use std::collections::BTreeSet;

/// Hard cap on failures listed per suite, over and above the size-derived
/// limit.
pub const MAX_LISTED_FAILURES: usize = 30;

/// Take at most `limit` failures, with a hint line describing the rest.
pub fn limit_failures(failures: &[String], limit: usize) -> (Vec<String>, Option<String>) {
    if failures.len() <= limit {
        return (failures.to_vec(), None);
    }
    let listed = failures[..limit].to_vec();
    let hint = format!(
        "- ...{} more failure(s) ({} total)...",
        failures.len() - limit,
        failures.len()
    );
    (listed, Some(hint))
}

/// Build the human-readable reason string for a failed build.
///
/// `failed` holds (suite name, unforgiven deterministic failures) for every
/// suite whose failure is attributed to the change. The whole summary is
/// bounded by `size_limit` characters, with hint lines standing in for
/// whatever gets cut.
pub fn failure_reason(failed: &[(String, BTreeSet<String>)], size_limit: usize) -> String {
    let header = format!("{} Test Suite(s) failed.", failed.len());
    let mut lines = vec![header];
    let failure_limit = (size_limit / 100).clamp(1, MAX_LISTED_FAILURES);

    let mut current_size = 0usize;
    for (index, (name, failures)) in failed.iter().enumerate() {
        let suite_header = if failures.is_empty() {
            format!("**{name}** failed.")
        } else {
            format!("**{name}** failed because of:")
        };

        current_size += suite_header.len();
        if current_size >= size_limit {
            lines.push(format!("#### ...{} more test(s)...", failed.len() - index));
            return lines.join("\n\n");
        }
        lines.push(suite_header);

        let sorted: Vec<String> = failures.iter().cloned().collect();
        for (idx, failure) in sorted.iter().enumerate() {
            if idx >= failure_limit || current_size >= size_limit {
                let hint = format!(
                    "- ...{} more failure(s) ({} total)...",
                    sorted.len() - idx,
                    sorted.len()
                );
                current_size += hint.len();
                lines.push(hint);
                break;
            }
            current_size += failure.len();
            lines.push(format!("- {failure}"));
        }
    }

    lines.join("\n\n")
}

/// Per-suite annotation distinguishing failures attributed to the change,
/// failures forgiven because they also fail without the patch, and
/// known-flaky ignores.
pub fn suite_annotation(
    name: &str,
    new_failures: &BTreeSet<String>,
    ignored_failures: &BTreeSet<String>,
    ignored_flakes: &BTreeSet<String>,
) -> String {
    let mut sections = vec![format!("{name} (test results summary)")];

    let mut push_section = |title: &str, tests: &BTreeSet<String>| {
        if tests.is_empty() {
            return;
        }
        let listed: Vec<String> = tests.iter().cloned().collect();
        let (shown, hint) = limit_failures(&listed, MAX_LISTED_FAILURES);
        let mut section = String::from(title);
        for test in shown {
            section.push_str(&format!("\n- {test}"));
        }
        if let Some(hint) = hint {
            section.push('\n');
            section.push_str(&hint);
        }
        sections.push(section);
    };

    push_section("Tests failed with patch, and caused the build to fail:", new_failures);
    push_section(
        "Tests failed with patch, but ignored as they also fail without the patch:",
        ignored_failures,
    );
    push_section(
        "Tests ignored as they are known to be flaky:",
        ignored_flakes,
    );

    sections.join("\n\n")
}
