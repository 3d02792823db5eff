//! Runtime configuration, read once from the environment in `main` and
//! passed down explicitly to every process (tick, worker, server).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Production deployments always destroy the patch sandbox after use;
    /// dev environments keep it around after a failed apply for debugging.
    pub production: bool,
    /// Postgres connection string.
    pub dsn: String,
    /// Advisory lock file guarding the minute tick singleton.
    pub lock_file: PathBuf,
    /// Output directory for generated status pages and apply logs.
    pub web_root: PathBuf,
    /// Public URL prefix under which `web_root` is served.
    pub apply_url_base: String,
    /// The patchburner control script (sandbox collaborator).
    pub patchburner_ctl: String,

    pub user_agent: String,
    /// Bounded timeout applied to every outbound HTTP request.
    pub timeout: Duration,
    /// Polite sleep between HTTP requests to the archive/commitfest hosts.
    pub slow_fetch_sleep: Duration,

    /// Maximum number of branches in status `testing` at once.
    pub concurrent_builds: i64,
    /// Hours for a full bitrot sweep over all eligible submissions.
    pub cycle_time_hours: f64,
    pub concurrent_queue_workers: i64,

    pub cirrus_user: String,
    pub cirrus_repo: String,
    pub github_full_repo: String,
    /// Remote to push `cf/<id>` branches to; unset means "do not push".
    pub git_remote_name: Option<String>,
    pub git_ssh_command: String,
    /// Branch used as the statistical baseline (and merge base).
    pub mainline_branch: String,
    /// Release branches are also reference branches for statistics.
    pub release_branch_prefix: String,

    pub commitfest_host: String,
    /// Where branch/task status callbacks are POSTed; unset means log only.
    pub commitfest_post_url: Option<String>,
    pub commitfest_shared_secret: String,
    /// Shared secret expected in the webhook header, when configured.
    pub cirrus_webhook_secret: Option<String>,
    /// Webhook endpoint bind address.
    pub listen_addr: String,

    /// Submissions never selected by the scheduler.
    pub ignore_submissions: Vec<i64>,

    /// Days before artifact bodies and command logs are nulled out.
    pub retention_large_objects_days: i64,
    /// Days before build/task data is deleted outright.
    pub retention_all_days: i64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build a config from the environment.  Every option has a default
    /// suitable for a development setup; production overrides via env.
    pub fn from_env() -> Self {
        let github_full_repo = env_or("GITHUB_FULL_REPO", "postgresql-cfbot/postgresql");
        let (default_user, default_repo) = match github_full_repo.split_once('/') {
            Some((user, repo)) => (user.to_string(), repo.to_string()),
            None => (github_full_repo.clone(), String::new()),
        };
        Config {
            production: env_parse("PRODUCTION", false),
            dsn: env_or("DSN", "postgres://localhost/cfbot"),
            lock_file: PathBuf::from(env_or("LOCK_FILE", "/tmp/cfbot-lock")),
            web_root: PathBuf::from(env_or("WEB_ROOT", "www")),
            apply_url_base: env_or("APPLY_URL_BASE", "http://cfbot.cputube.org"),
            patchburner_ctl: env_or("PATCHBURNER_CTL", "./cfbot_patchburner_ctl.sh"),
            user_agent: env_or("USER_AGENT", "cfbot from http://cfbot.cputube.org"),
            timeout: Duration::from_secs_f64(env_parse("TIMEOUT", 20.0)),
            slow_fetch_sleep: Duration::from_secs_f64(env_parse("SLOW_FETCH_SLEEP", 0.0)),
            concurrent_builds: env_parse("CONCURRENT_BUILDS", 4),
            cycle_time_hours: env_parse("CYCLE_TIME", 48.0),
            concurrent_queue_workers: env_parse("CONCURRENT_QUEUE_WORKERS", 4),
            cirrus_user: env_or("CIRRUS_USER", &default_user),
            cirrus_repo: env_or("CIRRUS_REPO", &default_repo),
            github_full_repo,
            git_remote_name: env_opt("GIT_REMOTE_NAME"),
            git_ssh_command: env_or("GIT_SSH_COMMAND", "ssh"),
            mainline_branch: env_or("MAINLINE_BRANCH", "master"),
            release_branch_prefix: env_or("RELEASE_BRANCH_PREFIX", "REL_"),
            commitfest_host: env_or("COMMITFEST_HOST", "https://commitfest.postgresql.org"),
            commitfest_post_url: env_opt("COMMITFEST_POST_URL"),
            commitfest_shared_secret: env_or("COMMITFEST_SHARED_SECRET", ""),
            cirrus_webhook_secret: env_opt("CIRRUS_WEBHOOK_SECRET"),
            listen_addr: env_or("LISTEN_ADDR", "127.0.0.1:8080"),
            ignore_submissions: env_or("IGNORE_SUBMISSIONS", "")
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect(),
            retention_large_objects_days: env_parse("RETENTION_LARGE_OBJECTS", 2),
            retention_all_days: env_parse("RETENTION_ALL", 90),
        }
    }

    /// Is `branch_name` a reference branch (mainline or release branch)?
    /// Reference branches supply the expected-time-in-status baselines.
    pub fn is_reference_branch(&self, branch_name: &str) -> bool {
        branch_name == self.mainline_branch || branch_name.starts_with(&self.release_branch_prefix)
    }

    /// The reference branch whose statistics apply to `branch_name`.
    pub fn reference_branch_for<'a>(&'a self, branch_name: &'a str) -> &'a str {
        if self.is_reference_branch(branch_name) {
            branch_name
        } else {
            &self.mainline_branch
        }
    }

    /// Public URL of a file under `web_root`.
    pub fn apply_url(&self, file: &str) -> String {
        format!("{}/{}", self.apply_url_base.trim_end_matches('/'), file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    /// Serialize tests that mutate process env to prevent races.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let saved = env::var("CONCURRENT_BUILDS").ok();
        env::remove_var("CONCURRENT_BUILDS");
        env::remove_var("PRODUCTION");
        let config = Config::from_env();
        assert!(!config.production);
        assert_eq!(config.concurrent_builds, 4);
        assert_eq!(config.cycle_time_hours, 48.0);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config.ignore_submissions.is_empty());
        if let Some(val) = saved {
            env::set_var("CONCURRENT_BUILDS", val);
        }
    }

    #[test]
    fn test_ignore_list_parsing() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("IGNORE_SUBMISSIONS", "4431, 4365");
        let config = Config::from_env();
        assert_eq!(config.ignore_submissions, vec![4431, 4365]);
        env::remove_var("IGNORE_SUBMISSIONS");
    }

    #[test]
    fn test_cirrus_repo_from_full_repo() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("GITHUB_FULL_REPO", "someone/postgres");
        env::remove_var("CIRRUS_USER");
        env::remove_var("CIRRUS_REPO");
        let config = Config::from_env();
        assert_eq!(config.cirrus_user, "someone");
        assert_eq!(config.cirrus_repo, "postgres");
        env::remove_var("GITHUB_FULL_REPO");
    }

    #[test]
    fn test_reference_branch() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = Config::from_env();
        assert!(config.is_reference_branch("master"));
        assert!(config.is_reference_branch("REL_17_STABLE"));
        assert!(!config.is_reference_branch("cf/4000"));
        assert_eq!(config.reference_branch_for("cf/4000"), "master");
        assert_eq!(
            config.reference_branch_for("REL_16_STABLE"),
            "REL_16_STABLE"
        );
    }
}
