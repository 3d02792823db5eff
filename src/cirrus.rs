//! Client for the CI provider's GraphQL API.
//!
//! Polling is expensive and only ever happens from explicit work items
//! (`poll-stale-build`, `poll-stale-branch`, `fetch-task-commands`); the
//! webhook stream is the fast path.

pub mod state;
pub mod sweep;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::Fetcher;
use crate::types::CiStatus;

const GRAPHQL_URL: &str = "https://api.cirrus-ci.com/graphql";

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub local_group_id: Option<i64>,
}

impl TaskSummary {
    pub fn parsed_status(&self) -> Result<CiStatus> {
        self.status
            .parse()
            .with_context(|| format!("task {} has unrecognised status", self.id))
    }

    /// Display position of the task within its build.
    pub fn position(&self) -> Option<i32> {
        self.local_group_id.map(|g| g as i32 + 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDetail {
    pub id: String,
    pub status: String,
    pub branch: String,
    pub change_id_in_repo: String,
    #[serde(default)]
    pub tasks: Vec<TaskSummary>,
}

impl BuildDetail {
    pub fn parsed_status(&self) -> Result<CiStatus> {
        self.status
            .parse()
            .with_context(|| format!("build {} has unrecognised status", self.id))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub command_type: Option<String>,
    pub status: String,
    #[serde(default)]
    pub duration_in_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactGroup {
    pub name: String,
    #[serde(default)]
    pub files: Vec<ArtifactFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDetail {
    #[serde(default)]
    pub commands: Vec<CommandInfo>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactGroup>,
}

async fn query<T: for<'de> Deserialize<'de>>(
    http: &Fetcher,
    query_text: &str,
    variables: serde_json::Value,
) -> Result<Option<T>> {
    let request = GraphqlRequest {
        query: query_text,
        variables,
    };
    let response: GraphqlResponse<T> = http.post_json(GRAPHQL_URL, &request).await?;
    Ok(response.data)
}

/// Look up one build with its tasks.  `None` means the CI service denies
/// knowledge of the build id.
pub async fn get_build(http: &Fetcher, build_id: &str) -> Result<Option<BuildDetail>> {
    #[derive(Deserialize)]
    struct Data {
        build: Option<BuildDetail>,
    }
    let data: Option<Data> = query(
        http,
        "query buildById($id: ID!) {
           build(id: $id) {
             id
             status
             branch
             changeIdInRepo
             tasks {
               id
               name
               status
               localGroupId
             }
           }
         }",
        serde_json::json!({ "id": build_id }),
    )
    .await?;
    Ok(data.and_then(|d| d.build))
}

/// Find builds for a commit, newest first.
pub async fn search_builds(
    http: &Fetcher,
    owner: &str,
    repo: &str,
    sha: &str,
) -> Result<Vec<BuildDetail>> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Data {
        #[serde(default)]
        search_builds: Vec<BuildDetail>,
    }
    let data: Option<Data> = query(
        http,
        "query buildBySha($owner: String!, $repo: String!, $sha: String!) {
           searchBuilds(repositoryOwner: $owner, repositoryName: $repo, SHA: $sha) {
             id
             status
             branch
             changeIdInRepo
             tasks {
               id
               name
               status
               localGroupId
             }
           }
         }",
        serde_json::json!({ "owner": owner, "repo": repo, "sha": sha }),
    )
    .await?;
    Ok(data.map(|d| d.search_builds).unwrap_or_default())
}

/// Fetch a task's per-command metadata and artifact listing.
pub async fn get_task(http: &Fetcher, task_id: &str) -> Result<Option<TaskDetail>> {
    #[derive(Deserialize)]
    struct Data {
        task: Option<TaskDetail>,
    }
    let data: Option<Data> = query(
        http,
        "query taskById($id: ID!) {
           task(id: $id) {
             commands {
               name
               type
               status
               durationInSeconds
             }
             artifacts {
               name
               files {
                 path
                 size
               }
             }
           }
         }",
        serde_json::json!({ "id": task_id }),
    )
    .await?;
    Ok(data.and_then(|d| d.task))
}

/// URL of a command's log file.
pub fn task_log_url(task_id: &str, command: &str) -> String {
    format!("https://api.cirrus-ci.com/v1/task/{task_id}/logs/{command}.log")
}

/// URL of an artifact file.
pub fn artifact_url(task_id: &str, name: &str, path: &str) -> String {
    format!("https://api.cirrus-ci.com/v1/artifact/task/{task_id}/{name}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_detail_shape() {
        let json = r#"{
            "id": "123",
            "status": "EXECUTING",
            "branch": "cf/4000",
            "changeIdInRepo": "abc123",
            "tasks": [
                {"id": "t1", "name": "Linux", "status": "SCHEDULED", "localGroupId": 0},
                {"id": "t2", "name": "Windows", "status": "CREATED", "localGroupId": 1}
            ]
        }"#;
        let build: BuildDetail = serde_json::from_str(json).unwrap();
        assert_eq!(build.parsed_status().unwrap(), CiStatus::Executing);
        assert_eq!(build.tasks.len(), 2);
        assert_eq!(build.tasks[0].position(), Some(1));
        assert_eq!(build.tasks[1].position(), Some(2));
    }

    #[test]
    fn test_null_build_means_unknown() {
        let json = r#"{"data": {"build": null}}"#;
        #[derive(Deserialize)]
        struct Data {
            build: Option<BuildDetail>,
        }
        let response: GraphqlResponse<Data> = serde_json::from_str(json).unwrap();
        assert!(response.data.unwrap().build.is_none());
    }

    #[test]
    fn test_task_detail_shape() {
        let json = r#"{
            "commands": [
                {"name": "build", "type": "EXECUTE_SCRIPT", "status": "SUCCESS", "durationInSeconds": 123.4}
            ],
            "artifacts": [
                {"name": "testrun", "files": [{"path": "build/testrun/foo/bar/log", "size": 10}]}
            ]
        }"#;
        let task: TaskDetail = serde_json::from_str(json).unwrap();
        assert_eq!(task.commands[0].name, "build");
        assert_eq!(task.artifacts[0].files[0].path, "build/testrun/foo/bar/log");
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            task_log_url("42", "build"),
            "https://api.cirrus-ci.com/v1/task/42/logs/build.log"
        );
        assert_eq!(
            artifact_url("42", "testrun", "build/x"),
            "https://api.cirrus-ci.com/v1/artifact/task/42/testrun/build/x"
        );
    }
}
