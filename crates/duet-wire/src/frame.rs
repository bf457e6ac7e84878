/// One `event:`/`data:` block of the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// Groups incoming lines into frames. A frame is an `event:` line followed
/// by zero or more `data:` lines, terminated by a blank line; multiple data
/// lines join with `\n`.
///
/// `token` frames flush eagerly on each data line instead of waiting for
/// the separator, so token latency is one line rather than one frame.
#[derive(Default)]
pub struct FrameAssembler {
    event: Option<String>,
    data: Vec<String>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a completed frame when one closes.
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.flush();
        }

        if let Some(name) = strip_field(line, "event") {
            // A new event name starts a new frame; anything buffered for a
            // previous frame that never saw its separator is dropped.
            self.event = Some(name.to_string());
            self.data.clear();
            return None;
        }

        if let Some(payload) = strip_field(line, "data") {
            match self.event.as_deref() {
                Some("token") => {
                    return Some(Frame {
                        event: "token".to_string(),
                        data: payload.to_string(),
                    });
                }
                Some(_) => self.data.push(payload.to_string()),
                // data line before any event name: not a frame we know.
                None => {}
            }
        }

        // Unrecognized field lines (comments, ids) are ignored.
        None
    }

    fn flush(&mut self) -> Option<Frame> {
        let event = self.event.take()?;
        let data = std::mem::take(&mut self.data).join("\n");

        // An eagerly-flushed token frame leaves nothing behind; don't emit
        // a second, empty frame at the separator.
        if event == "token" && data.is_empty() {
            return None;
        }

        Some(Frame { event, data })
    }
}

fn strip_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
