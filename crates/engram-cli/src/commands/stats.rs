use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use engram::memory::types::{SessionMeta, SessionMetrics};
use engram::session::SessionId;
use engram::storage::DurableStore;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct StatsCommand {
    #[clap(long, help = "Restrict statistics to one session")]
    pub session: Option<String>,
}

impl StatsCommand {
    pub async fn execute(
        &self,
        store: &dyn DurableStore,
        format: OutputFormat,
    ) -> CliResult<String> {
        let sessions: Vec<SessionMeta> = match &self.session {
            Some(raw) => {
                let id = SessionId::try_from(raw.as_str())?;
                let meta = store
                    .load_session_meta(&id)
                    .await?
                    .ok_or_else(|| format!("Session not found: {raw}"))?;
                vec![meta]
            }
            None => store.list_sessions().await?,
        };

        let turns: u64 = sessions.iter().map(|m| m.turn_counter).sum();
        let totals = sum_metrics(sessions.iter().map(|m| &m.metrics));

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "sessions": sessions.len(),
                    "turns": turns,
                    "expansion_ratio": totals.expansion_ratio(),
                    "metrics": totals,
                });
                Ok(serde_json::to_string_pretty(&output)?)
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Metric", "Value"]);

                let rows = [
                    ("Sessions", sessions.len().to_string()),
                    ("Turns", turns.to_string()),
                    ("Stored", totals.total_stores.to_string()),
                    ("Skipped (short)", totals.skipped_short.to_string()),
                    ("Skipped (low grade)", totals.skipped_low_grade.to_string()),
                    ("Skipped (grader down)", totals.skipped_unavailable.to_string()),
                    ("Reabsorbs", totals.reabsorbs.to_string()),
                    (
                        "  interval / usage",
                        format!("{} / {}", totals.interval_triggers, totals.usage_triggers),
                    ),
                    ("Records reinjected", totals.reinjected_records.to_string()),
                    ("Recalls", totals.total_recalls.to_string()),
                    ("Chars saved", totals.total_chars_saved.to_string()),
                    ("Expansion ratio", format!("{:.2}x", totals.expansion_ratio())),
                    ("Corrupt records skipped", totals.corrupt_skipped.to_string()),
                    ("Persist failures", totals.persist_failures.to_string()),
                ];
                for (name, value) in rows {
                    table.add_row([name.to_string(), value]);
                }

                Ok(format!("Engram Statistics\n=================\n\n{table}"))
            }
        }
    }
}

fn sum_metrics<'a>(all: impl Iterator<Item = &'a SessionMetrics>) -> SessionMetrics {
    all.fold(SessionMetrics::default(), |mut acc, m| {
        acc.total_stores += m.total_stores;
        acc.total_recalls += m.total_recalls;
        acc.total_chars_saved += m.total_chars_saved;
        acc.original_chars += m.original_chars;
        acc.encoded_chars += m.encoded_chars;
        acc.skipped_short += m.skipped_short;
        acc.skipped_low_grade += m.skipped_low_grade;
        acc.skipped_unavailable += m.skipped_unavailable;
        acc.reabsorbs += m.reabsorbs;
        acc.reinjected_records += m.reinjected_records;
        acc.interval_triggers += m.interval_triggers;
        acc.usage_triggers += m.usage_triggers;
        acc.corrupt_skipped += m.corrupt_skipped;
        acc.persist_failures += m.persist_failures;
        acc
    })
}
