//! The pattern-action engine: a durable queue consumer that runs local
//! file/pipe/exec side effects on matching products.
//!
//! The rule table is an ordered list; every rule whose feedtype and pattern
//! match a product fires (order matters only for the `_ELSE_` fallback,
//! which fires when nothing above it matched and the identifier does not
//! start with `_`). After each fully processed product the engine persists
//! the product's arrival time, so a restart resumes strictly after the last
//! success.

mod actions;
mod parser;
mod template;

pub use self::actions::{ActionContext, ActionError, ActionKind};
pub use self::parser::{parse_pqact_file, parse_pqact_str, PqactFileError, ELSE_PATTERN};
pub use self::template::{expand, TemplateError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::class::{ClassSpec, Pattern, ProductClass};
use crate::control::SignalControl;
use crate::feedtype::{builtin_table, Feedtype, FeedtypeTable};
use crate::product::{ProductInfo, Timestamp};
use crate::queue::{Cursor, NextOutcome, ProductQueue, Wake};
use crate::state::CursorFile;
use crate::util::tokenize_quoted;

/// One pattern-action rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub feedtype: Feedtype,
    pub pattern: Pattern,
    pub kind: ActionKind,
    pub template: String,
    /// Removed from the table when its action fails permanently.
    pub transient: bool,
    /// `^_ELSE_$` fallback rule.
    pub is_else: bool,
}

/// The ordered rule list.
#[derive(Clone, Debug, Default)]
pub struct RuleTable {
    pub rules: Vec<Rule>,
}

/// Outcome of pushing one product through the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// All fired actions completed (or failed permanently); move on.
    Done,
    /// A transient contention occurred; hold the cursor and retry.
    Retry,
}

/// Engine options, typically from the `pqact` command line.
pub struct EngineOptions {
    pub conffile: PathBuf,
    /// Overall product filter (`-f`/`-p`).
    pub feedtype: Feedtype,
    pub pattern: String,
    /// Empty-queue poll interval (`-i`).
    pub interval: Duration,
    /// Pipe write deadline (`-t`).
    pub pipe_timeout: Duration,
    /// Start this far before now (`-o`), overriding a saved cursor.
    pub offset: Option<Duration>,
}

pub struct PatternActionEngine {
    queue: Arc<ProductQueue>,
    control: SignalControl,
    options: EngineOptions,
    feedtypes: FeedtypeTable,
    table: RuleTable,
    actions: ActionContext,
    class: ProductClass,
    cursor_file: CursorFile,
    last_processed: Option<Timestamp>,
    processed: u64,
}

impl PatternActionEngine {
    pub fn new(
        queue: Arc<ProductQueue>,
        control: SignalControl,
        options: EngineOptions,
    ) -> Result<PatternActionEngine> {
        let feedtypes = builtin_table();
        let table = parse_pqact_file(&options.conffile, &feedtypes)
            .with_context(|| format!("loading {}", options.conffile.display()))?;
        let class = ProductClass::new(vec![ClassSpec::new(options.feedtype, &options.pattern)
            .context("bad product filter")?]);
        let actions = ActionContext::new(options.pipe_timeout);
        let cursor_file = CursorFile::for_config(&options.conffile);
        Ok(PatternActionEngine {
            queue,
            control,
            options,
            feedtypes,
            table,
            actions,
            class,
            cursor_file,
            last_processed: None,
            processed: 0,
        })
    }

    /// Initial cursor: `-o offset` wins, then the saved state (unless it is
    /// in the future), else the current tail.
    fn position(&self) -> Result<Cursor> {
        if let Some(offset) = self.options.offset {
            let now = Timestamp::now();
            let start = Timestamp::new(now.sec.saturating_sub(offset.as_secs()), now.usec);
            log::info!("starting {}s before now", offset.as_secs());
            return Ok(Cursor::after(start));
        }
        match self.cursor_file.load() {
            Some(saved) if saved <= Timestamp::now() => {
                log::info!("resuming after {}", saved);
                Ok(Cursor::after(saved))
            }
            Some(saved) => {
                log::warn!("saved cursor {} is in the future; starting at the tail", saved);
                Ok(self.queue.cursor_at_end()?)
            }
            None => Ok(self.queue.cursor_at_end()?),
        }
    }

    /// Consumes the queue until TERM. Persists the cursor after every
    /// processed product and once more on the way out.
    pub fn run(&mut self) -> Result<()> {
        let mut cursor = self.position()?;
        loop {
            if self.control.is_done() {
                break;
            }
            if self.control.take_hup() {
                self.reload();
            }
            self.control.take_cycle_verbosity();

            let mut visited: Option<(ProductInfo, Disposition)> = None;
            let outcome = {
                let table = &mut self.table;
                let actions = &mut self.actions;
                let visited_ref = &mut visited;
                self.queue.next(&mut cursor, &self.class, |info, data| {
                    let disposition = process_product(table, actions, info, data);
                    let retry = disposition == Disposition::Retry;
                    *visited_ref = Some((info.clone(), disposition));
                    !retry
                })
            };
            match outcome {
                Ok(NextOutcome::Processed { delivered, .. }) => {
                    if let Some((info, Disposition::Done)) = visited.take() {
                        self.note_processed(info.arrival);
                    } else if delivered {
                        // Product skipped by the overall filter: progress
                        // still counts for the durable cursor.
                        self.save_cursor(&cursor);
                    }
                    if !delivered {
                        // Contention: give the LRU pool a moment.
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
                Ok(NextOutcome::Corrupt) => {
                    log::warn!("skipped a corrupt slot");
                }
                Ok(NextOutcome::EndOfQueue) => {
                    self.actions.reap();
                    match self.queue.suspend(
                        &mut cursor,
                        self.options.interval,
                        Some(&self.control),
                    ) {
                        Wake::Overrun => {
                            log::warn!("fell behind the queue; products were reclaimed unseen");
                        }
                        Wake::Interrupted | Wake::NewData | Wake::Timeout => {}
                    }
                }
                Err(err) => {
                    log::error!("queue scan failed: {}", err);
                    break;
                }
            }
        }

        log::info!("draining after {} products", self.processed);
        if let Some(ts) = self.last_processed {
            if let Err(err) = self.cursor_file.store(ts) {
                log::error!("cannot persist cursor: {}", err);
            }
        }
        self.actions.shutdown();
        Ok(())
    }

    fn note_processed(&mut self, arrival: Timestamp) {
        self.processed += 1;
        self.last_processed = Some(arrival);
        if let Err(err) = self.cursor_file.store(arrival) {
            log::error!("cannot persist cursor: {}", err);
        }
    }

    fn save_cursor(&mut self, cursor: &Cursor) {
        self.last_processed = Some(cursor.ts);
        if let Err(err) = self.cursor_file.store(cursor.ts) {
            log::error!("cannot persist cursor: {}", err);
        }
    }

    /// HUP: reread the pattern-action file; keep the old table on error.
    fn reload(&mut self) {
        log::info!("rereading {}", self.options.conffile.display());
        match parse_pqact_file(&self.options.conffile, &self.feedtypes) {
            Ok(table) => self.table = table,
            Err(err) => log::error!("reload failed, keeping the previous table: {}", err),
        }
    }
}

/// Runs every matching rule's action for one product. Public for the
/// integration tests, which drive the table without a live queue consumer.
pub fn process_product(
    table: &mut RuleTable,
    actions: &mut ActionContext,
    info: &ProductInfo,
    data: &[u8],
) -> Disposition {
    let now = Timestamp::now();
    let mut matched = false;
    let mut retry = false;
    let mut remove: Vec<usize> = vec![];

    for (index, rule) in table.rules.iter().enumerate() {
        if !info.feedtype.intersects(rule.feedtype) {
            continue;
        }
        if rule.is_else && (matched || info.ident.starts_with('_')) {
            continue;
        }
        let captures = match rule.pattern.captures(&info.ident) {
            Some(captures) => captures,
            None if rule.is_else => {
                // The fallback pattern never matches a real identifier;
                // fabricate a whole-string match for template expansion.
                match run_rule(rule, None, info, data, now, actions) {
                    RuleOutcome::Ok => {
                        matched = true;
                        continue;
                    }
                    RuleOutcome::Retry => {
                        retry = true;
                        continue;
                    }
                    RuleOutcome::Failed => {
                        if rule.transient {
                            remove.push(index);
                        }
                        matched = true;
                        continue;
                    }
                }
            }
            None => continue,
        };
        if rule.is_else {
            // `^_ELSE_$` can only literally match the identifier `_ELSE_`,
            // which starts with `_` and was filtered above.
            continue;
        }
        matched = true;
        match run_rule(rule, Some(captures), info, data, now, actions) {
            RuleOutcome::Ok => {}
            RuleOutcome::Retry => retry = true,
            RuleOutcome::Failed => {
                if rule.transient {
                    remove.push(index);
                }
            }
        }
    }

    for index in remove.into_iter().rev() {
        let rule = table.rules.remove(index);
        log::warn!(
            "removing transient rule {} -> {:?} after permanent failure",
            rule.pattern.source(),
            rule.kind
        );
    }
    if retry {
        Disposition::Retry
    } else {
        Disposition::Done
    }
}

enum RuleOutcome {
    Ok,
    Retry,
    Failed,
}

fn run_rule(
    rule: &Rule,
    captures: Option<regex::Captures<'_>>,
    info: &ProductInfo,
    data: &[u8],
    now: Timestamp,
    actions: &mut ActionContext,
) -> RuleOutcome {
    let expanded = match &captures {
        Some(captures) => expand(&rule.template, captures, info.arrival, info.seqno, now),
        None => {
            // Fallback rules have no capture groups to substitute.
            let whole = Pattern::compile("^.*$").expect("static pattern");
            match whole.captures(&info.ident) {
                Some(captures) => {
                    expand(&rule.template, &captures, info.arrival, info.seqno, now)
                }
                None => return RuleOutcome::Failed,
            }
        }
    };
    let expanded = match expanded {
        Ok(expanded) => expanded,
        Err(err) => {
            log::error!(
                "template {:?} failed for {}: {}",
                rule.template,
                info.ident,
                err
            );
            return RuleOutcome::Failed;
        }
    };
    let argv = tokenize_quoted(&expanded);
    if argv.is_empty() && rule.kind != ActionKind::Noop {
        log::error!("empty action for {}", info.ident);
        return RuleOutcome::Failed;
    }
    log::debug!("{:?} {:?} <- {}", rule.kind, argv, info.ident);
    match actions.run(rule.kind, &argv, info, data) {
        Ok(()) => RuleOutcome::Ok,
        Err(ActionError::Busy(what)) => {
            log::info!("busy ({}); will retry {}", what, info.ident);
            RuleOutcome::Retry
        }
        Err(err) => {
            log::error!("action failed for {}: {}", info.ident, err);
            RuleOutcome::Failed
        }
    }
}
