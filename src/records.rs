//! Record source: turns an agency file into a lazy stream of bets.

use std::path::Path;

use futures_util::stream::{self, Stream};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::{RecordError, RejectReason};
use crate::types::Bet;

pub type RecordItem = Result<Bet, RecordError>;

/// Opens `path` and streams one item per non-empty line.
///
/// Lines are read only as the stream is polled. A line that is not valid
/// UTF-8 or not a valid bet comes out as a [`RecordError`] and streaming
/// goes on. Only an I/O error ends the stream early, after being logged.
pub async fn open(
    path: impl AsRef<Path>,
    agency: &str,
) -> std::io::Result<impl Stream<Item = RecordItem>> {
    let path = path.as_ref();
    let file = File::open(path).await?;
    debug!(path = %path.display(), "bets file opened");

    let reader = BufReader::new(file);
    let agency = agency.to_owned();
    Ok(stream::unfold(
        (reader, Vec::new(), 0usize, agency),
        |(mut reader, mut buf, mut line_no, agency)| async move {
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => return None,
                    Ok(_) => {
                        line_no += 1;
                        let item = match std::str::from_utf8(&buf) {
                            Ok(line) if line.trim().is_empty() => continue,
                            Ok(line) => parse(&agency, line_no, line.trim_end_matches('\n')),
                            Err(_) => Err(RecordError {
                                line: line_no,
                                reason: RejectReason::Encoding,
                            }),
                        };
                        return Some((item, (reader, buf, line_no, agency)));
                    }
                    Err(e) => {
                        warn!(action = "read_file", result = "fail", line = line_no + 1, error = %e);
                        return None;
                    }
                }
            }
        },
    ))
}

/// In-memory source over raw input lines, numbered from 1.
pub fn from_lines<I>(agency: &str, lines: I) -> impl Stream<Item = RecordItem>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let items: Vec<RecordItem> = lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| parse(agency, i + 1, line.as_ref()))
        .collect();
    stream::iter(items)
}

fn parse(agency: &str, line: usize, text: &str) -> RecordItem {
    Bet::parse_line(agency, text).map_err(|reason| RecordError { line, reason })
}
