use anyhow::Context;
use clap::{Parser, Subcommand};
use diff_engine::{
    split_buffer_lines, BufferLines, CachedMatcher, ChunkHighlight, DiffChunk, Differ, FilterChain, InlineHighlighter,
    MergedChunk, Merger, Runner, Scheduler, SchedulerHost, Tag, TextBuffer,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use trimerge_core::config::Settings;
use trimerge_core::logging::init_logging;

#[derive(Parser)]
#[command(name = "trimerge", about = "Two- and three-way file comparison and merge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the settings file
    #[arg(long, default_value = ".trimerge/settings.json")]
    config: PathBuf,

    /// Also write logs to trimerge.log in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two or three files; with three, the middle one is the base
    Diff {
        #[arg(num_args = 2..=3, required = true)]
        files: Vec<PathBuf>,
        /// Print the chunk model as JSON
        #[arg(long)]
        json: bool,
        /// Ignore chunks that only add or remove blank lines
        #[arg(long)]
        ignore_blank_lines: bool,
        /// Compute character-level highlights inside changed chunks
        #[arg(long)]
        inline: bool,
    },
    /// Merge LEFT and RIGHT into BASE, marking unresolved conflicts
    Merge {
        left: PathBuf,
        base: PathBuf,
        right: PathBuf,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply every non-conflicting change in FROM to TO
    Pull {
        from: PathBuf,
        to: PathBuf,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a settings file with the default values
    InitConfig,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref())?;

    match &cli.command {
        Commands::Diff {
            files,
            json,
            ignore_blank_lines,
            inline,
        } => cmd_diff(&load_settings(&cli)?, files, *json, *ignore_blank_lines, *inline),
        Commands::Merge {
            left,
            base,
            right,
            output,
        } => cmd_merge(&load_settings(&cli)?, [left, base, right], output.as_deref()),
        Commands::Pull { from, to, output } => cmd_pull(&load_settings(&cli)?, from, to, output.as_deref()),
        Commands::InitConfig => cmd_init_config(&cli),
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    Settings::load_or_default(&cli.config)
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_output(output: Option<&Path>, text: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

/// Drives scheduler work from a plain loop; the terminal has no idle hook.
#[derive(Default)]
struct CliHost {
    last_status: Option<String>,
}

impl SchedulerHost for CliHost {
    fn arm_idle(&mut self) {
        tracing::trace!("scheduler armed");
    }

    fn disarm_idle(&mut self) {
        tracing::trace!("scheduler idle");
    }

    fn progress(&mut self, status: Option<&str>) {
        if let Some(status) = status {
            if self.last_status.as_deref() != Some(status) {
                tracing::debug!(status, "progress");
                self.last_status = Some(status.to_owned());
            }
        }
    }
}

/// One input file with its filtered line view.
struct Document {
    path: PathBuf,
    buffer: TextBuffer,
    lines: BufferLines,
}

impl Document {
    fn load(path: &Path, filters: &FilterChain) -> anyhow::Result<Self> {
        let buffer = TextBuffer::new(read_text(path)?);
        let lines = BufferLines::new(&buffer, filters.clone());
        Ok(Self {
            path: path.to_path_buf(),
            buffer,
            lines,
        })
    }

    fn filtered_lines(&mut self) -> Vec<String> {
        self.lines
            .lines(&self.buffer)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Serialize)]
struct DiffReport<'a> {
    files: Vec<String>,
    identical: bool,
    chunks: &'a [MergedChunk],
    conflicts: &'a [usize],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    inline: Vec<InlineReport>,
}

#[derive(Serialize)]
struct InlineReport {
    pane: usize,
    chunk: DiffChunk,
    base: Vec<(usize, usize)>,
    other: Vec<(usize, usize)>,
    coarse: bool,
}

impl From<ChunkHighlight> for InlineReport {
    fn from(h: ChunkHighlight) -> Self {
        let [base, other] = h.ranges;
        Self {
            pane: h.pane,
            chunk: h.chunk,
            base,
            other,
            coarse: h.coarse,
        }
    }
}

fn cmd_diff(
    settings: &Settings,
    files: &[PathBuf],
    json: bool,
    ignore_blank_lines: bool,
    inline: bool,
) -> anyhow::Result<ExitCode> {
    let filters = settings.filter_chain()?;
    let mut docs = files
        .iter()
        .map(|path| Document::load(path, &filters))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let filtered: Vec<Vec<String>> = docs.iter_mut().map(Document::filtered_lines).collect();
    let filtered_refs: Vec<&[String]> = filtered.iter().map(Vec::as_slice).collect();
    let raw: Vec<Vec<&str>> = docs.iter().map(|d| split_buffer_lines(d.buffer.text())).collect();
    let raw_refs: Vec<&[&str]> = raw.iter().map(Vec::as_slice).collect();

    let mut differ = Differ::new();
    differ.set_ignore_blanks(ignore_blank_lines || settings.comparison.ignore_blank_lines);
    {
        let mut runner = Runner::new(Scheduler::lifo(), CliHost::default());
        runner.add_task(differ.set_sequences(&filtered_refs), false);
        runner.run_until_idle();
    }
    tracing::info!(
        chunks = differ.diff_count(),
        conflicts = differ.conflicts().len(),
        "comparison finished"
    );

    let highlights = if inline && settings.inline.enabled {
        inline_highlights(settings, &differ, &raw_refs)?
    } else {
        Vec::new()
    };

    if json {
        let report = DiffReport {
            files: docs.iter().map(|d| d.path.display().to_string()).collect(),
            identical: differ.sequences_identical(),
            chunks: differ.merge_cache(),
            conflicts: differ.conflicts(),
            inline: highlights.into_iter().map(InlineReport::from).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if raw_refs.len() == 2 {
        print_two_way(&differ, &raw_refs);
    } else {
        print_three_way(&differ, &raw_refs);
    }

    // Same convention as diff(1): 1 means the inputs differ.
    Ok(if differ.sequences_identical() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn inline_highlights(settings: &Settings, differ: &Differ, texts: &[&[&str]]) -> anyhow::Result<Vec<ChunkHighlight>> {
    let mut matcher = CachedMatcher::new(settings.pool_config()).context("failed to start inline matcher")?;
    let mut highlighter = InlineHighlighter::new(settings.inline.char_limit);

    if highlighter.refresh(differ, texts, &mut matcher)? {
        let mut runner = Runner::new(Scheduler::lifo(), CliHost::default());
        runner.add_task(|| matcher.pump(), false);
        runner.run_until_idle();
    }
    let applied = highlighter.apply_arrivals(differ, texts);
    tracing::debug!(applied, "inline highlights applied");
    matcher.shutdown();

    let mut highlights: Vec<ChunkHighlight> = highlighter.highlights().cloned().collect();
    highlights.sort_by_key(|h| (h.chunk.start_a, h.pane));
    Ok(highlights)
}

/// `start,end` in 1-based lines; an empty range names the line before it.
fn format_range(start: usize, end: usize) -> String {
    match end - start {
        0 => start.to_string(),
        1 => end.to_string(),
        _ => format!("{},{}", start + 1, end),
    }
}

fn print_lines(prefix: &str, lines: &[&str]) {
    for line in lines {
        println!("{prefix}{line}");
    }
}

fn print_two_way(differ: &Differ, texts: &[&[&str]]) {
    for chunk in differ.pair_changes(0, 1, None) {
        let op = match chunk.tag {
            Tag::Insert => 'a',
            Tag::Delete => 'd',
            _ => 'c',
        };
        println!(
            "{}{}{}",
            format_range(chunk.start_a, chunk.end_a),
            op,
            format_range(chunk.start_b, chunk.end_b)
        );
        print_lines("< ", &texts[0][chunk.start_a..chunk.end_a]);
        if chunk.tag == Tag::Replace {
            println!("---");
        }
        print_lines("> ", &texts[1][chunk.start_b..chunk.end_b]);
    }
}

fn print_three_way(differ: &Differ, texts: &[&[&str]]) {
    for merged in differ.merge_cache() {
        let header = match (merged.left, merged.right) {
            _ if merged.is_conflict() => "====",
            (Some(_), None) => "====1",
            (None, Some(_)) => "====3",
            _ => "====2",
        };
        println!("{header}");
        let Some(base) = merged.any() else {
            continue;
        };
        if let Some(left) = merged.left {
            println!("1:{}", format_range(left.start_b, left.end_b));
            print_lines("  ", &texts[0][left.start_b..left.end_b]);
        }
        println!("2:{}", format_range(base.start_a, base.end_a));
        print_lines("  ", &texts[1][base.start_a..base.end_a]);
        if let Some(right) = merged.right {
            println!("3:{}", format_range(right.start_b, right.end_b));
            print_lines("  ", &texts[2][right.start_b..right.end_b]);
        }
    }
}

fn cmd_merge(settings: &Settings, paths: [&PathBuf; 3], output: Option<&Path>) -> anyhow::Result<ExitCode> {
    let texts = paths
        .iter()
        .map(|path| read_text(path))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let lines: Vec<Vec<&str>> = texts.iter().map(|t| split_buffer_lines(t)).collect();
    let refs: Vec<&[&str]> = lines.iter().map(Vec::as_slice).collect();

    let mut merger = Merger::new(settings.merge_options(&texts[1]));
    merger.differ_mut().set_auto_merge(settings.merge.auto_merge);
    merger.initialize(&refs).run();
    let result = merger.merge_3_files(&refs, true).run();
    write_output(output, &result.text)?;

    if result.has_conflicts() {
        tracing::warn!(
            conflicts = result.unresolved.len(),
            "merge finished with unresolved conflicts"
        );
        return Ok(ExitCode::from(1));
    }
    tracing::info!("merge finished cleanly");
    Ok(ExitCode::SUCCESS)
}

fn cmd_pull(settings: &Settings, from: &Path, to: &Path, output: Option<&Path>) -> anyhow::Result<ExitCode> {
    let texts = [read_text(from)?, read_text(to)?];
    let lines: Vec<Vec<&str>> = texts.iter().map(|t| split_buffer_lines(t)).collect();
    let refs: Vec<&[&str]> = lines.iter().map(Vec::as_slice).collect();

    let mut merger = Merger::new(settings.merge_options(&texts[1]));
    merger.initialize(&refs).run();
    let result = merger.merge_2_files(&refs, 0, 1).run();
    write_output(output, &result.text)?;
    tracing::info!(
        from = %from.display(),
        to = %to.display(),
        "pulled changes"
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_init_config(cli: &Cli) -> anyhow::Result<ExitCode> {
    if cli.config.exists() {
        anyhow::bail!("{} already exists", cli.config.display());
    }
    Settings::default().save(&cli.config)?;
    println!("Wrote default settings to {}", cli.config.display());
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_range() {
        assert_eq!(format_range(3, 3), "3");
        assert_eq!(format_range(3, 4), "4");
        assert_eq!(format_range(3, 6), "4,6");
    }

    #[test]
    fn test_cli_parses_diff() {
        let cli = Cli::try_parse_from(["trimerge", "diff", "a.txt", "b.txt", "c.txt", "--json"]).unwrap();
        match cli.command {
            Commands::Diff { files, json, .. } => {
                assert_eq!(files.len(), 3);
                assert!(json);
            }
            _ => panic!("expected diff"),
        }
        assert!(Cli::try_parse_from(["trimerge", "diff", "a.txt"]).is_err());
    }

    #[test]
    fn test_inline_report_from_highlight() {
        let highlight = ChunkHighlight {
            pane: 2,
            chunk: DiffChunk::new(Tag::Replace, 1, 2, 1, 2),
            ranges: [vec![(0, 3)], vec![(1, 2)]],
            coarse: false,
        };
        let report = InlineReport::from(highlight);
        assert_eq!(report.pane, 2);
        assert_eq!(report.base, vec![(0, 3)]);
        assert_eq!(report.other, vec![(1, 2)]);
    }
}
