//! cfbot - a patch-testing robot for a mailing-list-driven project.
//!
//! For each submission registered in the Commitfest app, the robot discovers
//! the latest patch email on its thread, applies the patches on top of
//! current master in a disposable sandbox, pushes the result as a `cf/<id>`
//! branch, follows the CI service's build of that branch through webhooks
//! reconciled against polling, and reports state back to the Commitfest app
//! and a set of generated status pages.
//!
//! # Modules
//!
//! - `archive`: mail-archive flat-thread scanning for patch attachments
//! - `cirrus`: CI API client, state machine, and stale-entity sweepers
//! - `commitfest`: Commitfest app client, sync, and status callbacks
//! - `config`: environment-driven configuration record
//! - `patch`: patch selection, sandbox apply, branch materialisation
//! - `queue`: the durable work queue and log/artifact ingestion
//! - `server`: the webhook endpoint
//! - `tick`: the minute/hourly/daily entry points
//! - `web`: generated status pages

pub mod archive;
pub mod cirrus;
pub mod commitfest;
pub mod config;
pub mod db;
pub mod gc;
pub mod net;
pub mod patch;
pub mod queue;
pub mod server;
pub mod stats;
pub mod tick;
pub mod types;
pub mod web;
