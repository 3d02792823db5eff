//! Daily garbage collection.  Large objects (artifact bodies, command logs)
//! are nulled out quickly; everything derived from old builds is deleted
//! bottom-up once the full retention window has passed.

use anyhow::Result;
use tracing::info;

use crate::db::App;

pub async fn run(app: &App) -> Result<()> {
    let large_days = app.config.retention_large_objects_days as i32;
    let all_days = app.config.retention_all_days as i32;
    let mut tx = app.begin().await?;

    // disk space is the scarce resource; drop bodies first
    sqlx::query(
        "update artifact
            set body = null
           from task
          where artifact.task_id = task.task_id
            and artifact.body is not null
            and task.created < now() - make_interval(days => $1)",
    )
    .bind(large_days)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "update task_command
            set log = null
           from task
          where task_command.task_id = task.task_id
            and task_command.log is not null
            and task.created < now() - make_interval(days => $1)",
    )
    .bind(large_days)
    .execute(&mut *tx)
    .await?;

    // bottom-up deletion of everything hanging off builds past retention
    for table in ["artifact", "test", "task_command", "highlight", "task_status_history"] {
        let sql = format!(
            "delete from {table}
              where task_id in (select task_id
                                  from task
                                  join build using (build_id)
                                 where build.created < now() - make_interval(days => $1))"
        );
        sqlx::query(&sql).bind(all_days).execute(&mut *tx).await?;
    }
    sqlx::query(
        "delete from task
          where build_id in (select build_id from build
                              where created < now() - make_interval(days => $1))",
    )
    .bind(all_days)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "delete from branch
          where build_id in (select build_id from build
                              where created < now() - make_interval(days => $1))",
    )
    .bind(all_days)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "delete from build_status_history
          where build_id in (select build_id from build
                              where created < now() - make_interval(days => $1))",
    )
    .bind(all_days)
    .execute(&mut *tx)
    .await?;
    sqlx::query("delete from build where created < now() - make_interval(days => $1)")
        .bind(all_days)
        .execute(&mut *tx)
        .await?;

    // branches that never got a build
    sqlx::query(
        "delete from branch
          where build_id is null
            and created < now() - make_interval(days => $1)",
    )
    .bind(all_days)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("garbage collection complete");
    Ok(())
}
