//! Terminal side of interactive labeling.

use photoface_core::organize::save_cluster_composite;
use photoface_core::{LabelDecision, NamePrompt, UnlabeledFace};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Where the face grid of the current cluster is written.
pub struct Preview {
    pub photo_root: PathBuf,
    pub path: PathBuf,
}

/// Reads one cluster name per line. `skip` or a blank line leaves the
/// cluster alone; `quit` or end of input ends the session.
pub struct TerminalPrompt<R, W> {
    input: R,
    output: W,
    preview: Option<Preview>,
}

impl<R: BufRead, W: Write> TerminalPrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            preview: None,
        }
    }

    /// Also write each cluster's sample faces as one image before asking.
    pub fn with_preview(mut self, preview: Preview) -> Self {
        self.preview = Some(preview);
        self
    }

    fn show(&mut self, cluster_no: usize, total: usize, size: usize, sample: &[UnlabeledFace]) -> std::io::Result<()> {
        writeln!(self.output)?;
        writeln!(self.output, "Cluster {cluster_no}/{total}: {size} face(s)")?;
        if let Some(preview) = &self.preview {
            match save_cluster_composite(sample, &preview.photo_root, &preview.path) {
                Ok(faces) => writeln!(self.output, "  preview of {faces} face(s): {}", preview.path.display())?,
                Err(e) => tracing::warn!(path = %preview.path.display(), error = %e, "cannot write cluster preview"),
            }
        }
        for face in sample {
            let l = face.location;
            writeln!(
                self.output,
                "  {} (top {}, right {}, bottom {}, left {})",
                face.photo, l.top, l.right, l.bottom, l.left
            )?;
        }
        if size > sample.len() {
            writeln!(self.output, "  ... and {} more", size - sample.len())?;
        }
        write!(self.output, "Name (blank or 'skip' to skip, 'quit' to stop): ")?;
        self.output.flush()
    }
}

impl<R: BufRead, W: Write> NamePrompt for TerminalPrompt<R, W> {
    fn ask(&mut self, cluster_no: usize, total: usize, cluster_size: usize, sample: &[UnlabeledFace]) -> LabelDecision {
        if let Err(e) = self.show(cluster_no, total, cluster_size, sample) {
            tracing::warn!(error = %e, "cannot write prompt");
            return LabelDecision::Stop;
        }

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => parse_answer(None),
            Ok(_) => parse_answer(Some(&line)),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read answer");
                LabelDecision::Stop
            }
        }
    }
}

/// Turn a typed answer into a decision. `None` is end of input.
pub fn parse_answer(line: Option<&str>) -> LabelDecision {
    let Some(line) = line else {
        return LabelDecision::Stop;
    };
    let answer = line.trim();
    if answer.is_empty() || answer.eq_ignore_ascii_case("skip") {
        LabelDecision::Skip
    } else if answer.eq_ignore_ascii_case("quit") {
        LabelDecision::Stop
    } else {
        LabelDecision::Name(answer.to_string())
    }
}
