//! Hourly recomputation of the expected-time-in-status statistics.
//!
//! The stale-entity detectors compare a running entity's elapsed time
//! against `avg + 3·stddev` over reference-branch entities that went on to
//! COMPLETE.  Only reference branches (mainline and release branches) feed
//! the statistics; cf/ branches carry untrusted patches and unstable
//! timings.

use anyhow::Result;

use crate::db::App;

/// Fully recompute both statistics tables from the history tables.
pub async fn refresh_status_statistics(app: &App) -> Result<()> {
    let mainline = &app.config.mainline_branch;
    let release_prefix = &app.config.release_branch_prefix;
    let mut tx = app.begin().await?;

    sqlx::query("delete from build_status_statistics")
        .execute(&mut *tx)
        .await?;
    // elapsed for a status = time from build creation to the observation
    // that the build left that status
    sqlx::query(
        "insert into build_status_statistics (branch_name, status, avg_elapsed, stddev_elapsed, n)
         select b.branch_name,
                h.status,
                avg(extract(epoch from h.next_received - b.created))::float8,
                coalesce(stddev(extract(epoch from h.next_received - b.created)), 0)::float8,
                count(*)
           from (select build_id,
                        status,
                        received,
                        lead(received) over (partition by build_id order by received)
                            as next_received
                   from build_status_history) h
           join build b using (build_id)
          where b.status = 'COMPLETED'
            and (b.branch_name = $1 or b.branch_name like $2 || '%')
            and h.next_received is not null
          group by 1, 2",
    )
    .bind(mainline)
    .bind(release_prefix)
    .execute(&mut *tx)
    .await?;

    sqlx::query("delete from task_status_statistics")
        .execute(&mut *tx)
        .await?;
    // tasks measure the time actually spent in each status, between
    // consecutive history rows
    sqlx::query(
        "insert into task_status_statistics
                (branch_name, task_name, status, avg_elapsed, stddev_elapsed, n)
         select b.branch_name,
                t.task_name,
                h.status,
                avg(extract(epoch from h.next_received - h.received))::float8,
                coalesce(stddev(extract(epoch from h.next_received - h.received)), 0)::float8,
                count(*)
           from (select task_id,
                        status,
                        received,
                        lead(received) over (partition by task_id order by received)
                            as next_received
                   from task_status_history) h
           join task t using (task_id)
           join build b on b.build_id = t.build_id
          where t.status = 'COMPLETED'
            and (b.branch_name = $1 or b.branch_name like $2 || '%')
            and h.next_received is not null
          group by 1, 2, 3",
    )
    .bind(mainline)
    .bind(release_prefix)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
