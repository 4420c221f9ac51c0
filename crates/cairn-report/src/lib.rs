use std::collections::HashMap;
use std::fmt::Write;
use std::io::{self, IsTerminal};
use std::path::Path;

use cairn_domain::{
    ApplyChangeResult, ApplyReport, ApplyStatus, ChangeKind, FieldChange, PlanReport,
    PlannedChange, Value,
};
use console::Style;

mod error;
mod options;

pub use error::ReportError;
pub use options::{ColorChoice, OutputFormat, RenderOptions};

/// Render a plan report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_plan(
    report: &PlanReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_plan_text(report, options)),
    }
}

/// Render an apply report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_apply(
    report: &ApplyReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_apply_text(report, options)),
    }
}

// ---------------------------------------------------------------------------
// Plan text
// ---------------------------------------------------------------------------

fn render_plan_text(report: &PlanReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);

    append_header(&mut output, "plan", options.target.as_deref(), &style);

    if report.changes.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings_and_errors(&mut output, &report.warnings, &report.errors, &style);
        if report.unchanged > 0 && options.verbose {
            let _ = writeln!(
                output,
                "  {}",
                style.dim(&format!("{} unchanged", report.unchanged))
            );
        }
        return output;
    }

    let _ = writeln!(output);
    append_warnings_and_errors(&mut output, &report.warnings, &report.errors, &style);
    for change in &report.changes {
        append_plan_change(&mut output, change, options, &style);
    }

    let _ = writeln!(output);
    let tally = TallyCounts::from_plan(report);
    let _ = writeln!(output, "{}", tally.format_plan(&style));

    output
}

// ---------------------------------------------------------------------------
// Apply text
// ---------------------------------------------------------------------------

fn render_apply_text(report: &ApplyReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    let change_map: HashMap<usize, &PlannedChange> = report
        .plan
        .changes
        .iter()
        .map(|change| (change.id, change))
        .collect();

    append_header(&mut output, "apply", options.target.as_deref(), &style);

    if report.results.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings_and_errors(&mut output, &[], &report.errors, &style);
        return output;
    }

    let _ = writeln!(output);
    append_warnings_and_errors(&mut output, &[], &report.errors, &style);
    for result in &report.results {
        let planned = change_map.get(&result.change_id).copied();
        append_apply_result(&mut output, result, planned, options, &style);
    }

    let _ = writeln!(output);
    let tally = ApplyTally::from_results(&report.results);
    let _ = writeln!(output, "{}", tally.format(&style));

    output
}

// ---------------------------------------------------------------------------
// Line renderers
// ---------------------------------------------------------------------------

fn append_header(output: &mut String, command: &str, target: Option<&str>, style: &TextStyle) {
    let _ = write!(output, "{}", style.header_command(command));
    if let Some(t) = target {
        let _ = write!(output, " {}", style.header_target(t));
    }
    let _ = writeln!(output);
}

fn append_plan_change(
    output: &mut String,
    change: &PlannedChange,
    options: &RenderOptions,
    style: &TextStyle,
) {
    let symbol = style.kind_symbol(change.kind);
    let label = TextStyle::pad_label(&style.kind_label(change.kind, kind_verb(change.kind)));
    let _ = writeln!(
        output,
        "  {symbol} {label}{}",
        style.primary_text(&change.key.to_string())
    );

    if options.verbose {
        let _ = writeln!(
            output,
            "      {}",
            style.dim(&format!("#{} {}", change.id, file_name(&change.file)))
        );
    }

    let show_fields = options.verbose || change.kind != ChangeKind::Create;
    if show_fields {
        for field in &change.fields {
            append_field_line(output, field, change.kind, options.verbose, style);
        }
    }

    if let Some(workflow) = &change.workflow {
        let _ = writeln!(
            output,
            "      {}",
            style.dim(&format!("via workflow {workflow}"))
        );
    }
    if let Some(hint) = &change.hint {
        let _ = writeln!(output, "      {} {hint}", style.warn_prefix("warn:"));
    }
}

fn append_field_line(
    output: &mut String,
    field: &FieldChange,
    kind: ChangeKind,
    verbose: bool,
    style: &TextStyle,
) {
    let pending = shorten_value(&field.pending, verbose);
    if kind == ChangeKind::Create {
        let _ = writeln!(output, "      {}: {pending}", field.field);
        return;
    }
    let current = shorten_value(&field.current, verbose);
    let marker = if field.updatable || kind != ChangeKind::Replace {
        String::new()
    } else {
        format!(" {}", style.conflict_label("(forces replacement)"))
    };
    let _ = writeln!(
        output,
        "      {}: {} {} {}{marker}",
        field.field,
        style.dim(&current),
        style.dim("->"),
        style.primary_text(&pending)
    );
}

fn append_apply_result(
    output: &mut String,
    result: &ApplyChangeResult,
    planned: Option<&PlannedChange>,
    options: &RenderOptions,
    style: &TextStyle,
) {
    let (symbol, label) = apply_symbol_and_label(result, style);
    let _ = writeln!(
        output,
        "  {symbol} {label}{}",
        style.primary_text(&result.key.to_string())
    );

    if !result.stages.is_empty() {
        let _ = writeln!(
            output,
            "      {}",
            style.dim(&format!("stages: {}", result.stages.join(", ")))
        );
    }

    if let Some(error) = &result.error {
        match result.status {
            ApplyStatus::Failed => {
                let _ = writeln!(output, "      {}", style.error_detail(error));
            }
            _ => {
                let _ = writeln!(output, "      {} {error}", style.warn_prefix("warn:"));
            }
        }
    }

    if options.verbose
        && let Some(change) = planned
    {
        let _ = writeln!(
            output,
            "      {}",
            style.dim(&format!("#{} {}", change.id, file_name(&change.file)))
        );
    }
}

// ---------------------------------------------------------------------------
// Warnings & Errors
// ---------------------------------------------------------------------------

fn append_warnings_and_errors(
    output: &mut String,
    warnings: &[String],
    errors: &[String],
    style: &TextStyle,
) {
    if warnings.is_empty() && errors.is_empty() {
        return;
    }
    let _ = writeln!(output);
    for w in warnings {
        let _ = writeln!(output, "  {} {w}", style.warn_prefix("warn:"));
    }
    for e in errors {
        let _ = writeln!(output, "  {} {e}", style.error_prefix("error:"));
    }
}

// ---------------------------------------------------------------------------
// Symbol + Label helpers
// ---------------------------------------------------------------------------

const fn kind_verb(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Create => "create",
        ChangeKind::Update => "update",
        ChangeKind::Replace => "replace",
        ChangeKind::Delete => "delete",
    }
}

const fn kind_past_tense(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Create => "created",
        ChangeKind::Update => "updated",
        ChangeKind::Replace => "replaced",
        ChangeKind::Delete => "deleted",
    }
}

fn apply_symbol_and_label(result: &ApplyChangeResult, style: &TextStyle) -> (String, String) {
    match result.status {
        ApplyStatus::Applied => (
            style.kind_symbol(result.kind),
            TextStyle::pad_label(&style.kind_label(result.kind, kind_past_tense(result.kind))),
        ),
        ApplyStatus::Failed => (
            TextStyle::pad_symbol(&style.error_op_symbol("!")),
            TextStyle::pad_label(&style.error_op_label("failed")),
        ),
        ApplyStatus::Skipped => (
            TextStyle::pad_symbol(&style.noop_symbol("=")),
            TextStyle::pad_label(&style.noop_label("skipped")),
        ),
        ApplyStatus::Declined => (
            TextStyle::pad_symbol(&style.noop_symbol("x")),
            TextStyle::pad_label(&style.noop_label("declined")),
        ),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().to_string(),
    )
}

const VALUE_WIDTH: usize = 60;

fn shorten_value(value: &Value, verbose: bool) -> String {
    let full = value.to_string().replace('\n', "\\n");
    if verbose || full.chars().count() <= VALUE_WIDTH {
        return full;
    }
    let head: String = full.chars().take(VALUE_WIDTH - 3).collect();
    format!("{head}...")
}

// ---------------------------------------------------------------------------
// Tally Counts (Plan)
// ---------------------------------------------------------------------------

struct TallyCounts {
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    errors: usize,
    unchanged: usize,
}

impl TallyCounts {
    fn from_plan(report: &PlanReport) -> Self {
        let mut tally = Self {
            creates: 0,
            updates: 0,
            replaces: 0,
            deletes: 0,
            errors: report.errors.len(),
            unchanged: report.unchanged,
        };
        for change in &report.changes {
            match change.kind {
                ChangeKind::Create => tally.creates += 1,
                ChangeKind::Update => tally.updates += 1,
                ChangeKind::Replace => tally.replaces += 1,
                ChangeKind::Delete => tally.deletes += 1,
            }
        }
        tally
    }

    fn format_plan(&self, style: &TextStyle) -> String {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(style.add_label(&format!("{} to create", self.creates)));
        }
        if self.updates > 0 {
            parts.push(style.change_label(&format!("{} to update", self.updates)));
        }
        if self.replaces > 0 {
            parts.push(style.conflict_label(&format!("{} to replace", self.replaces)));
        }
        if self.deletes > 0 {
            parts.push(style.error_op_label(&format!("{} to delete", self.deletes)));
        }
        if self.errors > 0 {
            parts.push(style.error_op_label(&format!("{} error", self.errors)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.tally_label("Plan:"))
        } else {
            format!("{} {}", style.tally_label("Plan:"), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Apply Tally
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ApplyTally {
    created: usize,
    updated: usize,
    replaced: usize,
    deleted: usize,
    failed: usize,
    skipped: usize,
    declined: usize,
}

impl ApplyTally {
    fn from_results(results: &[ApplyChangeResult]) -> Self {
        let mut tally = Self::default();
        for r in results {
            match (r.status, r.kind) {
                (ApplyStatus::Applied, ChangeKind::Create) => tally.created += 1,
                (ApplyStatus::Applied, ChangeKind::Update) => tally.updated += 1,
                (ApplyStatus::Applied, ChangeKind::Replace) => tally.replaced += 1,
                (ApplyStatus::Applied, ChangeKind::Delete) => tally.deleted += 1,
                (ApplyStatus::Failed, _) => tally.failed += 1,
                (ApplyStatus::Skipped, _) => tally.skipped += 1,
                (ApplyStatus::Declined, _) => tally.declined += 1,
            }
        }
        tally
    }

    fn format(&self, style: &TextStyle) -> String {
        let mut parts = Vec::new();
        if self.created > 0 {
            parts.push(style.add_label(&format!("{} created", self.created)));
        }
        if self.updated > 0 {
            parts.push(style.change_label(&format!("{} updated", self.updated)));
        }
        if self.replaced > 0 {
            parts.push(style.conflict_label(&format!("{} replaced", self.replaced)));
        }
        if self.deleted > 0 {
            parts.push(style.error_op_label(&format!("{} deleted", self.deleted)));
        }
        if self.failed > 0 {
            parts.push(style.error_op_label(&format!("{} failed", self.failed)));
        }
        if self.skipped > 0 {
            parts.push(style.dim(&format!("{} skipped", self.skipped)));
        }
        if self.declined > 0 {
            parts.push(style.dim(&format!("{} declined", self.declined)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.tally_label("Applied:"))
        } else {
            format!("{} {}", style.tally_label("Applied:"), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// TextStyle
// ---------------------------------------------------------------------------

const SYMBOL_WIDTH: usize = 3;
const LABEL_WIDTH: usize = 10;

#[derive(Debug, Clone)]
struct TextStyle {
    color_enabled: bool,
    // Symbols
    add_sym_style: Style,
    change_sym_style: Style,
    conflict_sym_style: Style,
    error_sym_style: Style,
    noop_sym_style: Style,
    // Labels
    add_label_style: Style,
    change_label_style: Style,
    conflict_label_style: Style,
    error_label_style: Style,
    noop_label_style: Style,
    // Content
    primary_style: Style,
    dim_style: Style,
    error_detail_style: Style,
    // Header
    header_cmd_style: Style,
    header_target_style: Style,
    // Prefixes
    warn_prefix_style: Style,
    error_prefix_style: Style,
    // Tally
    tally_label_style: Style,
}

impl TextStyle {
    fn new(choice: ColorChoice) -> Self {
        let enabled = should_color(choice);
        // console otherwise re-checks whether stdout is a terminal.
        let base = || Style::new().force_styling(enabled);
        Self {
            color_enabled: enabled,
            add_sym_style: base().green().bold(),
            change_sym_style: base().cyan().bold(),
            conflict_sym_style: base().yellow().bold(),
            error_sym_style: base().red().bold(),
            noop_sym_style: base().dim(),
            add_label_style: base().green(),
            change_label_style: base().cyan(),
            conflict_label_style: base().yellow(),
            error_label_style: base().red(),
            noop_label_style: base().dim(),
            primary_style: base().white(),
            dim_style: base().dim(),
            error_detail_style: base().red(),
            header_cmd_style: base().white().bold(),
            header_target_style: base().dim(),
            warn_prefix_style: base().yellow().bold(),
            error_prefix_style: base().red().bold(),
            tally_label_style: base().white().bold(),
        }
    }

    fn paint<T: std::fmt::Display>(&self, style: &Style, text: T) -> String {
        if self.color_enabled {
            style.apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn pad(painted: &str, width: usize, right_align: bool) -> String {
        // Visible width ignores ANSI escapes.
        let visible_len = console::measure_text_width(painted);
        let fill = " ".repeat(width.saturating_sub(visible_len));
        if right_align {
            format!("{fill}{painted}")
        } else if visible_len < width {
            format!("{painted}{fill}")
        } else {
            format!("{painted} ")
        }
    }

    fn pad_label(painted: &str) -> String {
        Self::pad(painted, LABEL_WIDTH, false)
    }

    fn pad_symbol(painted: &str) -> String {
        Self::pad(painted, SYMBOL_WIDTH, true)
    }

    fn kind_symbol(&self, kind: ChangeKind) -> String {
        let painted = match kind {
            ChangeKind::Create => self.paint(&self.add_sym_style, "+"),
            ChangeKind::Update => self.paint(&self.change_sym_style, "~"),
            ChangeKind::Replace => self.paint(&self.conflict_sym_style, "-/+"),
            ChangeKind::Delete => self.paint(&self.error_sym_style, "-"),
        };
        Self::pad_symbol(&painted)
    }

    fn kind_label(&self, kind: ChangeKind, text: &str) -> String {
        match kind {
            ChangeKind::Create => self.add_label(text),
            ChangeKind::Update => self.change_label(text),
            ChangeKind::Replace => self.conflict_label(text),
            ChangeKind::Delete => self.error_op_label(text),
        }
    }

    // Symbols
    fn error_op_symbol(&self, s: &str) -> String {
        self.paint(&self.error_sym_style, s)
    }
    fn noop_symbol(&self, s: &str) -> String {
        self.paint(&self.noop_sym_style, s)
    }

    // Labels
    fn add_label(&self, s: &str) -> String {
        self.paint(&self.add_label_style, s)
    }
    fn change_label(&self, s: &str) -> String {
        self.paint(&self.change_label_style, s)
    }
    fn conflict_label(&self, s: &str) -> String {
        self.paint(&self.conflict_label_style, s)
    }
    fn error_op_label(&self, s: &str) -> String {
        self.paint(&self.error_label_style, s)
    }
    fn noop_label(&self, s: &str) -> String {
        self.paint(&self.noop_label_style, s)
    }

    // Content
    fn primary_text(&self, s: &str) -> String {
        self.paint(&self.primary_style, s)
    }
    fn dim(&self, s: &str) -> String {
        self.paint(&self.dim_style, s)
    }
    fn error_detail(&self, s: &str) -> String {
        self.paint(&self.error_detail_style, s)
    }

    // Header
    fn header_command(&self, s: &str) -> String {
        self.paint(&self.header_cmd_style, s)
    }
    fn header_target(&self, s: &str) -> String {
        self.paint(&self.header_target_style, s)
    }

    // Prefixes
    fn warn_prefix(&self, s: &str) -> String {
        self.paint(&self.warn_prefix_style, s)
    }
    fn error_prefix(&self, s: &str) -> String {
        self.paint(&self.error_prefix_style, s)
    }

    // Tally
    fn tally_label(&self, s: &str) -> String {
        self.paint(&self.tally_label_style, s)
    }
}

fn should_color(choice: ColorChoice) -> bool {
    match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stdout().is_terminal(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
