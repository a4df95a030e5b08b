//! Rendering of the aggregate report: build links, the markdown summary
//! table and report titles.

use cbuild_core::build::BuildState;
use cbuild_core::execution::{BuildTally, Conclusion, ExecutionState};
use chrono::{DateTime, SecondsFormat, Utc};

/// Link to one build of an execution.
pub fn build_url(base_url: &str, state: &ExecutionState, build_key: &str) -> String {
    format!(
        "{}/api/v1/repo/{}/commit/{}/exec/{}/build/{}",
        base_url.trim_end_matches('/'),
        state.repo_id,
        state.execution_id.commit(),
        state.execution_id.padded_number(),
        build_key
    )
}

/// Link to an execution.
pub fn execution_url(base_url: &str, state: &ExecutionState) -> String {
    format!(
        "{}/api/v1/repo/{}/commit/{}/exec/{}",
        base_url.trim_end_matches('/'),
        state.repo_id,
        state.execution_id.commit(),
        state.execution_id.padded_number()
    )
}

fn status_cell(build: &BuildState) -> String {
    match build.status {
        Some(status) => format!("{} {}", status.emoji(), status.text()),
        None => "-".to_string(),
    }
}

fn duration_cell(build: &BuildState) -> String {
    build
        .job
        .as_ref()
        .and_then(|job| job.duration())
        .map(|d| format!("{}s", (d.num_milliseconds() + 500) / 1000))
        .unwrap_or_else(|| "-".to_string())
}

/// Markdown summary of every build, sorted by key.
pub fn render_summary(state: &ExecutionState, base_url: &str, now: DateTime<Utc>) -> String {
    let mut lines = Vec::with_capacity(state.builds.len() + 4);

    let refresh = if state.is_running {
        format!(" (Updates every {} seconds)", state.wait_seconds)
    } else {
        String::new()
    };
    lines.push(format!(
        "_Details last refreshed at {}{}_",
        now.to_rfc3339_opts(SecondsFormat::Millis, true),
        refresh
    ));
    lines.push(String::new());
    lines.push("| Build | Status | Phase | Duration |".to_string());
    lines.push("| ----- | ------ | ----- | -------- |".to_string());

    let mut builds: Vec<&BuildState> = state.builds.iter().collect();
    builds.sort_by(|a, b| a.key.cmp(&b.key));
    for build in builds {
        let phase = build
            .job
            .as_ref()
            .and_then(|job| job.phase.as_deref())
            .unwrap_or("-");
        lines.push(format!(
            "| [{}]({}) | {} | {} | {} |",
            build.key,
            build_url(base_url, state, &build.key),
            status_cell(build),
            phase,
            duration_cell(build)
        ));
    }

    lines.join("\n")
}

fn builds(n: usize) -> String {
    format!("{} build{}", n, if n == 1 { "" } else { "s" })
}

/// Title of the completed aggregate report.
pub fn conclusion_title(conclusion: Conclusion, tally: BuildTally) -> String {
    match conclusion {
        Conclusion::Stopped => "Stopped by User".to_string(),
        Conclusion::Error => "Internal System Error".to_string(),
        Conclusion::Failed => format!("{} failed", builds(tally.failed)),
        Conclusion::Succeeded => format!("{} succeeded", builds(tally.succeeded)),
        Conclusion::Neutral => format!("{} skipped", builds(tally.skipped)),
    }
}
