// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cron-driven self-activation and the periodic reflection pass.
//!
//! Both timer families stop cleanly on graph reload and on process shutdown;
//! one tick's failure never stops future ticks.

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{Local, Timelike};
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hive_config::{CronJob, GraphSpec, ProviderKind};

use crate::controller::SystemController;
use crate::fanout::OutboundEvent;
use crate::journal;

/// Interval between reflection passes.
const REFLECTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Reflection only runs inside this local-time window.
const ACTIVE_HOURS_START: u32 = 8;
const ACTIVE_HOURS_END: u32 = 23;

/// Replies shorter than this are treated as trivial and discarded.
const MIN_REFLECTION_LEN: usize = 40;

const REFLECTION_SYSTEM: &str = "You are the private reflection pass of an AI agent. \
     Read the agent's journal for today and distil what is worth remembering long-term: \
     decisions, open threads, lessons, and facts about the people and systems involved. \
     Reply with a short markdown list. Reply with NOTHING if there is nothing durable.";

/// Running timers for one graph generation.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop all timers.  Idempotent; running ticks are aborted.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Parse a cron expression, accepting both the 5-field crontab form and the
/// 6/7-field form with seconds.
pub fn parse_cron(expression: &str) -> anyhow::Result<Schedule> {
    let normalised = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalised)
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expression:?}: {e}"))
}

/// Install cron triggers and the reflection timer for the given graph.
pub fn start(controller: Weak<SystemController>, graph: &GraphSpec) -> SchedulerHandle {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();

    for agent in &graph.agents {
        for job in &agent.data.cron_jobs {
            match parse_cron(&job.expression) {
                Ok(schedule) => {
                    info!(agent = %agent.id, expr = %job.expression, "installing cron trigger");
                    tasks.push(tokio::spawn(cron_loop(
                        controller.clone(),
                        agent.id.clone(),
                        schedule,
                        job.clone(),
                        shutdown.subscribe(),
                    )));
                }
                Err(e) => warn!(agent = %agent.id, "skipping cron trigger: {e}"),
            }
        }
    }

    tasks.push(tokio::spawn(reflection_loop(
        controller,
        shutdown.subscribe(),
    )));

    SchedulerHandle { shutdown, tasks }
}

async fn cron_loop(
    controller: Weak<SystemController>,
    agent_id: String,
    schedule: Schedule,
    job: CronJob,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(next) = schedule.upcoming(Local).next() else {
            return;
        };
        let Ok(wait) = (next - Local::now()).to_std() else {
            continue;
        };
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        if *shutdown.borrow() {
            return;
        }
        let Some(controller) = controller.upgrade() else {
            return;
        };
        let Some(worker) = controller.worker(&agent_id).await else {
            return;
        };
        if worker.is_busy() {
            debug!(agent = %agent_id, "busy at cron tick; dropping");
            continue;
        }
        let prompt = job.prompt.clone();
        tokio::spawn(async move {
            worker.talk(&prompt).await;
        });
    }
}

async fn reflection_loop(
    controller: Weak<SystemController>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(REFLECTION_INTERVAL) => {}
        }
        if *shutdown.borrow() {
            return;
        }
        let hour = Local::now().hour();
        if !(ACTIVE_HOURS_START..ACTIVE_HOURS_END).contains(&hour) {
            continue;
        }
        let Some(controller) = controller.upgrade() else {
            return;
        };
        run_reflection_pass(&controller).await;
    }
}

/// One reflection sweep over every agent: read today's journal, ask that
/// agent's own model for durable takeaways, append them to long-term memory.
///
/// Runs outside the agents' conversation engines so their sessions stay
/// untouched.
pub async fn run_reflection_pass(controller: &Arc<SystemController>) {
    let workspace = controller.workspace().to_path_buf();
    let today = Local::now().date_naive();
    for worker in controller.workers_snapshot().await {
        let journal_text = journal::read_day(&workspace, worker.id(), today);
        if journal_text.trim().is_empty() {
            continue;
        }
        let settings = worker.settings();
        if settings.api_key.is_none() && settings.kind != ProviderKind::Mock {
            warn!(agent = %worker.id(), "no credential for reflection; skipping");
            continue;
        }
        let provider = controller.build_provider(settings, worker.id());
        let prompt = format!("Journal for today:\n\n{journal_text}");
        match provider.complete_text(REFLECTION_SYSTEM, &prompt).await {
            Ok(reply) if reply.trim().len() >= MIN_REFLECTION_LEN => {
                if let Err(e) = journal::append_memory(&workspace, worker.id(), reply.trim()) {
                    warn!(agent = %worker.id(), "memory append failed: {e:#}");
                    continue;
                }
                controller.broadcast(OutboundEvent::SystemMessage {
                    message: format!("{} reflected on today's work", worker.name()),
                });
            }
            Ok(_) => debug!(agent = %worker.id(), "reflection was trivial; discarded"),
            Err(e) => warn!(agent = %worker.id(), "reflection call failed: {e:#}"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
