/*!
# Saving chains to CSV

[`SavingCallback`] appends one row per executed step. Enable via the `csv` feature.

Each row holds `!`-separated field groups:

```text
iter,slot,!,state...,!,proposal...,!,ll...,!,ll_proposal...,!,accepted...
```

`state` and `proposal` are the full accepted and proposed parameter vectors after the step,
`ll` and `ll_proposal` the per-block log-likelihoods of the executing slot, and `accepted`
holds one `0`/`1` flag per slot for that iteration. A header row of the same shape comes
first.
*/

use csv::{Writer, WriterBuilder};
use ndarray::s;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::callbacks::{Callback, Phase};
use crate::distributions::TargetLaw;
use crate::error::Result;
use crate::schedule::McmcStep;
use crate::workspace::{GlobalWorkspace, LocalWorkspace};

const GROUP_SEPARATOR: &str = "!";

/**
Returns `path` if nothing exists there yet, else the first free `stem_1.ext`, `stem_2.ext`, ...

# Examples

```rust
use mcmc_updates::io::csv::available_path;
use std::path::Path;

let path = Path::new("/definitely/not/there/chain.csv");
assert_eq!(available_path(path), path);
```
*/
pub fn available_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|i| {
            let name = match &ext {
                Some(ext) => format!("{stem}_{i}.{ext}"),
                None => format!("{stem}_{i}"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Streams executed steps into a CSV file at checkpoints and at the end of the run.
#[derive(Debug)]
pub struct SavingCallback {
    path: PathBuf,
    overwrite: bool,
    checkpoints: BTreeSet<usize>,
    pending: Vec<McmcStep>,
    writer: Option<Writer<File>>,
}

impl SavingCallback {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overwrite: false,
            checkpoints: BTreeSet::new(),
            pending: Vec::new(),
            writer: None,
        }
    }

    /// Writes to the given path even if a file already exists there.
    pub fn set_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Iterations (0-based) after which buffered rows are written out.
    pub fn set_checkpoints(mut self, iters: impl IntoIterator<Item = usize>) -> Self {
        self.checkpoints = iters.into_iter().collect();
        self
    }

    /// Target file. Final once the callback has been initialized.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_pending<L: TargetLaw>(
        &mut self,
        global: &GlobalWorkspace<L>,
        locals: &[LocalWorkspace],
    ) -> Result<()> {
        if let Some(wtr) = self.writer.as_mut() {
            for &step in &self.pending {
                wtr.write_record(record(global, locals, step))?;
            }
            wtr.flush()?;
        }
        self.pending.clear();
        Ok(())
    }
}

fn header(dim: usize, blocks: usize, slots: usize) -> Vec<String> {
    let mut row = vec!["iter".to_string(), "slot".to_string()];
    let groups = [
        ("state", dim),
        ("proposal", dim),
        ("ll", blocks),
        ("ll_proposal", blocks),
        ("accepted", slots),
    ];
    for (name, n) in groups {
        row.push(GROUP_SEPARATOR.to_string());
        row.extend((0..n).map(|i| format!("{name}_{i}")));
    }
    row
}

fn record<L: TargetLaw>(
    global: &GlobalWorkspace<L>,
    locals: &[LocalWorkspace],
    step: McmcStep,
) -> Vec<String> {
    let local = &locals[step.slot];
    let mut row = vec![step.iter.to_string(), step.slot.to_string()];
    let numbers = [
        global.state_history.slice(s![step.iter, step.slot, ..]),
        global.state_proposal_history.slice(s![step.iter, step.slot, ..]),
        local.ll_history.row(step.iter),
        local.ll_proposal_history.row(step.iter),
    ];
    for group in numbers {
        row.push(GROUP_SEPARATOR.to_string());
        row.extend(group.iter().map(|x| x.to_string()));
    }
    row.push(GROUP_SEPARATOR.to_string());
    row.extend(
        locals
            .iter()
            .map(|l| (l.acceptance_history[step.iter] as u8).to_string()),
    );
    row
}

impl<L: TargetLaw> Callback<L> for SavingCallback {
    fn init(&mut self, global: &GlobalWorkspace<L>) -> Result<()> {
        if !self.overwrite {
            self.path = available_path(&self.path);
        }
        let mut wtr = WriterBuilder::new().flexible(true).from_path(&self.path)?;
        wtr.write_record(header(
            global.dim(),
            global.law.num_blocks(),
            global.num_slots(),
        ))?;
        wtr.flush()?;
        log::info!("saving chain to {}", self.path.display());
        self.writer = Some(wtr);
        Ok(())
    }

    fn should_execute(&self, _step: McmcStep, phase: Phase) -> bool {
        phase == Phase::PostStep
    }

    fn execute(
        &mut self,
        global: &GlobalWorkspace<L>,
        locals: &[LocalWorkspace],
        step: McmcStep,
        _phase: Phase,
    ) -> Result<()> {
        if let Some(last) = self.pending.last().copied() {
            if step.iter > last.iter && self.checkpoints.contains(&last.iter) {
                self.write_pending(global, locals)?;
            }
        }
        self.pending.push(step);
        Ok(())
    }

    fn cleanup(
        &mut self,
        global: &GlobalWorkspace<L>,
        locals: &[LocalWorkspace],
        _final_step: Option<McmcStep>,
    ) -> Result<()> {
        self.write_pending(global, locals)?;
        self.writer = None;
        Ok(())
    }
}
