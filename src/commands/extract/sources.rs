use super::*;

/// Where page text and rasters come from. Pages are loaded one at a time so
/// a bad page fails alone and the document deadline is checked in between.
pub(crate) trait PageSource: Send + Sync {
    /// Content slice handed to the format detector.
    fn leading_bytes(&self, path: &Path) -> Result<Vec<u8>>;

    fn page_count(&self, path: &Path) -> Result<u32>;

    /// `page` is 1-based.
    fn load_page(&self, path: &Path, page: u32) -> Result<PageContent>;
}

/// Plain configuration dumps: a single page laid out on a fixed grid.
pub(crate) struct KeyValueSource;

impl PageSource for KeyValueSource {
    fn leading_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        read_leading_bytes(path, SNIFF_BYTE_LIMIT)
    }

    fn page_count(&self, _path: &Path) -> Result<u32> {
        Ok(1)
    }

    fn load_page(&self, path: &Path, page: u32) -> Result<PageContent> {
        if page != 1 {
            bail!("{} has a single page, requested {page}", path.display());
        }
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let text = String::from_utf8_lossy(&raw).replace('\u{0000}', "");

        Ok(PageContent {
            page,
            lines: lines_from_plain_text(&text),
            raster: None,
        })
    }
}

/// PDFs through the poppler command-line tools.
pub(crate) struct PopplerSource {
    dpi: f64,
    /// Bound on each poppler invocation; hung tools are killed.
    tool_timeout: Option<Duration>,
    pub(super) word_pattern: Regex,
    page_count_pattern: Regex,
}

impl PopplerSource {
    pub(crate) fn new(dpi: f64, tool_timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            dpi,
            tool_timeout,
            word_pattern: Regex::new(
                r#"<word xMin="(?P<x0>[-\d.]+)" yMin="(?P<y0>[-\d.]+)" xMax="(?P<x1>[-\d.]+)" yMax="(?P<y1>[-\d.]+)">(?P<text>.*?)</word>"#,
            )
            .context("failed to compile pdftotext bbox word regex")?,
            page_count_pattern: Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")
                .context("failed to compile pdfinfo page count regex")?,
        })
    }

    fn render_page(&self, pdf_path: &Path, page: u32) -> Result<PageRaster> {
        let pdf_stem = pdf_path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("pdf");
        let safe_stem = pdf_stem
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() {
                    character
                } else {
                    '_'
                }
            })
            .collect::<String>();

        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let output_root = std::env::temp_dir().join(format!(
            "relayscan_raster_{}_{}_{}_{}",
            safe_stem,
            std::process::id(),
            page,
            stamp
        ));
        let png_path = PathBuf::from(format!("{}.png", output_root.display()));

        let output = run_tool(
            Command::new("pdftoppm")
                .arg("-f")
                .arg(page.to_string())
                .arg("-l")
                .arg(page.to_string())
                .arg("-r")
                .arg(format!("{}", self.dpi))
                .arg("-gray")
                .arg("-singlefile")
                .arg("-png")
                .arg(pdf_path)
                .arg(&output_root),
            self.tool_timeout,
        )
        .with_context(|| format!("failed to execute pdftoppm for {}", pdf_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdftoppm returned non-zero exit status for {} page {}: {}",
                pdf_path.display(),
                page,
                stderr.trim()
            );
        }

        let decoded = image::open(&png_path)
            .with_context(|| format!("failed to decode raster {}", png_path.display()));
        let _ = fs::remove_file(&png_path);

        Ok(PageRaster {
            image: decoded?.to_luma8(),
            dpi: self.dpi,
        })
    }
}

impl PageSource for PopplerSource {
    fn leading_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let output = run_tool(
            Command::new("pdftotext")
                .args(["-enc", "UTF-8", "-f", "1", "-l", "1"])
                .arg(path)
                .arg("-"),
            self.tool_timeout,
        )
        .with_context(|| format!("failed to execute pdftotext for {}", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdftotext returned non-zero exit status for {}: {}",
                path.display(),
                stderr.trim()
            );
        }

        let mut leading = output.stdout;
        leading.truncate(SNIFF_BYTE_LIMIT);
        Ok(leading)
    }

    fn page_count(&self, path: &Path) -> Result<u32> {
        let output = run_tool(
            Command::new("pdfinfo").arg(path),
            self.tool_timeout,
        )
        .with_context(|| format!("failed to execute pdfinfo for {}", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdfinfo returned non-zero exit status for {}: {}",
                path.display(),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.page_count_pattern
            .captures(&stdout)
            .and_then(|captures| captures.get(1))
            .with_context(|| format!("pdfinfo reported no page count for {}", path.display()))?
            .as_str()
            .parse::<u32>()
            .with_context(|| format!("invalid page count for {}", path.display()))
    }

    fn load_page(&self, path: &Path, page: u32) -> Result<PageContent> {
        let output = run_tool(
            Command::new("pdftotext")
                .arg("-bbox")
                .args(["-enc", "UTF-8"])
                .arg("-f")
                .arg(page.to_string())
                .arg("-l")
                .arg(page.to_string())
                .arg(path)
                .arg("-"),
            self.tool_timeout,
        )
        .with_context(|| format!("failed to execute pdftotext for {}", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pdftotext -bbox returned non-zero exit status for {} page {}: {}",
                path.display(),
                page,
                stderr.trim()
            );
        }

        let html = String::from_utf8_lossy(&output.stdout);
        let words = parse_bbox_words(&html, &self.word_pattern);
        let raster = self.render_page(path, page)?;

        Ok(PageContent {
            page,
            lines: lines_from_words(words),
            raster: Some(raster),
        })
    }
}

/// Word boxes from `pdftotext -bbox` output, in points with a top-left origin.
pub(crate) fn parse_bbox_words(html: &str, pattern: &Regex) -> Vec<(String, BoundingBox)> {
    pattern
        .captures_iter(html)
        .filter_map(|captures| {
            let coordinate = |name: &str| captures.name(name)?.as_str().parse::<f64>().ok();
            let bbox = BoundingBox::from_corners(
                coordinate("x0")?,
                coordinate("y0")?,
                coordinate("x1")?,
                coordinate("y1")?,
            );
            let text = unescape_html(captures.name("text")?.as_str());
            if text.trim().is_empty() {
                return None;
            }
            Some((text, bbox))
        })
        .collect()
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

const TOOL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `command` to completion like `Command::output`, killing the child
/// once `limit` elapses.
pub(crate) fn run_tool(command: &mut Command, limit: Option<Duration>) -> Result<Output> {
    let Some(limit) = limit else {
        return Ok(command.output()?);
    };

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    // Drain both pipes so a chatty tool cannot block on a full buffer.
    let stdout = child.stdout.take().map(drain_pipe);
    let stderr = child.stderr.take().map(drain_pipe);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            bail!("killed after {} ms without finishing", limit.as_millis());
        }
        thread::sleep(TOOL_POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: join_pipe(stdout),
        stderr: join_pipe(stderr),
    })
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_pipe(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub(crate) fn command_version_optional(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
}

pub(crate) fn collect_tool_versions() -> ToolVersions {
    ToolVersions {
        pdfinfo: command_version_optional("pdfinfo", &["-v"]),
        pdftotext: command_version_optional("pdftotext", &["-v"]),
        pdftoppm: command_version_optional("pdftoppm", &["-v"]),
    }
}
