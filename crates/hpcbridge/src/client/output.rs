use cli_table::format::Separator;
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use colored::Colorize;

use crate::engine::RunSummary;
use crate::job::{Job, Status};
use crate::recovery::RecoverySnapshot;

pub struct CliOutput {
    color_policy: ColorChoice,
}

fn status_color(status: Status) -> Option<Color> {
    match status {
        Status::Complete => Some(Color::Green),
        Status::SubmitError => Some(Color::Red),
        Status::Running | Status::Finished => Some(Color::Yellow),
        Status::Held | Status::WaitingAdmission => Some(Color::Cyan),
        Status::Prepared | Status::Staged | Status::Submitted | Status::Queued => None,
    }
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table();
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }

    pub fn print_job_list(&self, jobs: &[Job]) {
        let rows: Vec<_> = jobs
            .iter()
            .map(|job| {
                vec![
                    job.name.clone().cell(),
                    job.resource.clone().cell(),
                    job.status
                        .to_string()
                        .cell()
                        .foreground_color(status_color(job.status)),
                    job.remote_id.clone().unwrap_or_default().cell(),
                    job.remote_dir_name.clone().cell(),
                    job.last_error
                        .as_deref()
                        .map(|error| error.lines().next().unwrap_or_default())
                        .unwrap_or_default()
                        .cell(),
                ]
            })
            .collect();
        let header = vec![
            "Name".cell().bold(true),
            "Resource".cell().bold(true),
            "Status".cell().bold(true),
            "Remote ID".cell().bold(true),
            "Remote directory".cell().bold(true),
            "Last error".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    pub fn print_snapshot(&self, path: &std::path::Path, snapshot: &RecoverySnapshot) {
        let mut rows = vec![
            vec![
                "Recovery file".cell().bold(true),
                path.display().to_string().cell(),
            ],
            vec![
                "Written at".cell().bold(true),
                snapshot
                    .written_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
                    .cell(),
            ],
        ];
        for (name, record) in &snapshot.resources {
            let scheduler = record
                .resource
                .scheduler
                .map(|family| family.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let ceiling = record
                .admission
                .slot_ceiling
                .map(|ceiling| ceiling.to_string())
                .unwrap_or_else(|| "not reached".to_string());
            rows.push(vec![
                format!("Resource `{name}`").cell().bold(true),
                format!(
                    "{} ({scheduler}), {} job(s) active, limit {ceiling}",
                    record.resource.destination(),
                    record.admission.slots_in_use
                )
                .cell(),
            ]);
        }
        self.print_vertical_table(rows);
        self.print_job_list(&snapshot.jobs);
    }

    pub fn print_summary(&self, summary: &RunSummary) {
        let complete = format!("{} complete", summary.complete);
        let failed = format!("{} failed to submit", summary.submit_error);
        let incomplete = format!("{} incomplete", summary.incomplete);
        println!(
            "{}, {}, {}",
            if summary.complete > 0 {
                complete.green()
            } else {
                complete.normal()
            },
            if summary.submit_error > 0 {
                failed.red()
            } else {
                failed.normal()
            },
            if summary.incomplete > 0 {
                incomplete.yellow()
            } else {
                incomplete.normal()
            }
        );
    }

    pub fn print_script(&self, job: &Job, family: &str, script: &str) {
        println!("{}", format!("# {} ({family})", job.name).bold());
        println!("{script}");
    }

    pub fn print_error(&self, error: anyhow::Error) {
        eprintln!("{}", format!("{error:?}").red());
    }
}
