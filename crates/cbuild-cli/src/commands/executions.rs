//! Execution commands.

use anyhow::{Context, Result, bail};
use cbuild_core::id::{ExecutionId, RepoId};
use serde_json::Value;
use url::Url;

fn repo_url(api_url: &str, repo: &str) -> Result<Url> {
    let repo_id: RepoId = repo.parse()?;
    let base = Url::parse(api_url).with_context(|| format!("invalid API URL: {}", api_url))?;
    Ok(base.join(&format!("/api/v1/repo/{}/", repo_id))?)
}

fn execution_url(api_url: &str, repo: &str, id: &str, suffix: &str) -> Result<Url> {
    let id: ExecutionId = id.parse()?;
    Ok(repo_url(api_url, repo)?.join(&format!(
        "commit/{}/exec/{}{}",
        id.commit(),
        id.padded_number(),
        suffix
    ))?)
}

async fn send(request: reqwest::RequestBuilder) -> Result<Value> {
    let response = request.send().await.context("Failed to reach the API server")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("no details");
        bail!("API returned {}: {}", status, message);
    }
    Ok(body)
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    value[field].as_str().unwrap_or("-")
}

pub async fn list(api_url: &str, repo: &str, commit: Option<String>, limit: u32) -> Result<()> {
    let mut url = repo_url(api_url, repo)?.join("executions")?;
    url.query_pairs_mut().append_pair("limit", &limit.to_string());
    if let Some(commit) = &commit {
        url.query_pairs_mut().append_pair("commit", commit);
    }

    let body = send(reqwest::Client::new().get(url)).await?;
    let executions = body.as_array().cloned().unwrap_or_default();
    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<10} {}", "EXECUTION", "STATUS", "RESULT", "CREATED");
    for execution in &executions {
        println!(
            "{:<20} {:<10} {:<10} {}",
            str_field(execution, "execution_id"),
            str_field(execution, "status"),
            str_field(execution, "conclusion"),
            str_field(execution, "created_at"),
        );
    }
    Ok(())
}

pub async fn show(api_url: &str, repo: &str, id: &str) -> Result<()> {
    let url = execution_url(api_url, repo, id, "")?;
    let body = send(reqwest::Client::new().get(url)).await?;

    println!("Execution:  {}", str_field(&body, "execution_id"));
    println!("Trace:      {}", str_field(&body, "trace_id"));
    println!("Status:     {}", str_field(&body, "status"));
    println!("Conclusion: {}", str_field(&body, "conclusion"));
    if let Some(error) = body["error"].as_str() {
        println!("Error:      {}", error);
    }
    if let Some(stop) = body["stop"].as_object() {
        println!(
            "Stopped by: {}",
            stop.get("user").and_then(Value::as_str).unwrap_or("-")
        );
    }

    println!();
    println!("{:<24} {:<24} {}", "BUILD", "STATUS", "JOB");
    for build in body["builds"].as_array().into_iter().flatten() {
        println!(
            "{:<24} {:<24} {}",
            str_field(build, "key"),
            str_field(build, "status"),
            build["job"]["id"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn stop(api_url: &str, repo: &str, id: &str, user: &str) -> Result<()> {
    let mut url = execution_url(api_url, repo, id, "/stop")?;
    url.query_pairs_mut().append_pair("user", user);

    send(reqwest::Client::new().post(url)).await?;
    println!("Stop requested for {}", id);
    Ok(())
}
