use url::Url;

/// Scroll geometry as reported by the host view, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub offset: f64,
    pub content_height: f64,
    pub viewport_height: f64,
}

impl Viewport {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.viewport_height - self.offset).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollCommand {
    To { offset: f64, animated: bool },
    ToBottom { animated: bool },
}

/// Scroll position captured before older content is prepended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub previous_offset: f64,
    pub previous_height: f64,
}

impl ScrollAnchor {
    pub fn capture(viewport: &Viewport) -> Self {
        Self {
            previous_offset: viewport.offset,
            previous_height: viewport.content_height,
        }
    }

    /// Shifts the old offset by the height the prepended page added, so the item that
    /// was topmost stays topmost. Applied without animation.
    pub fn restore(&self, new_height: f64) -> ScrollCommand {
        ScrollCommand::To {
            offset: self.previous_offset + (new_height - self.previous_height),
            animated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillTicket {
    pub cursor: String,
    pub anchor: ScrollAnchor,
}

/// Bidirectional paging state. Works purely on cursors and scroll geometry; it never
/// looks at message contents.
#[derive(Debug)]
pub struct Pagination {
    next: Option<String>,
    in_flight: bool,
    backfill_trigger_px: f64,
    live_edge_threshold_px: f64,
}

impl Pagination {
    pub fn new(backfill_trigger_px: f64, live_edge_threshold_px: f64) -> Self {
        Self {
            next: None,
            in_flight: false,
            backfill_trigger_px,
            live_edge_threshold_px,
        }
    }

    pub fn has_older(&self) -> bool {
        self.next.is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn set_next(&mut self, raw: Option<&str>) {
        self.next = raw.and_then(normalize_cursor);
    }

    /// Claims the single backfill slot when the viewport is near the top and older
    /// pages remain. A second call while one is in flight returns `None`.
    pub fn begin_backfill(&mut self, viewport: &Viewport) -> Option<BackfillTicket> {
        if self.in_flight || viewport.offset > self.backfill_trigger_px {
            return None;
        }
        let cursor = self.next.clone()?;
        self.in_flight = true;
        Some(BackfillTicket {
            cursor,
            anchor: ScrollAnchor::capture(viewport),
        })
    }

    pub fn finish_backfill(&mut self, next: Option<&str>) {
        self.in_flight = false;
        self.set_next(next);
    }

    /// Releases the slot after a failed fetch; the cursor is kept for the next try.
    pub fn abort_backfill(&mut self) {
        self.in_flight = false;
    }

    /// Auto-scroll only when the reader was already at the live edge.
    pub fn live_edge_command(&self, viewport: Option<&Viewport>) -> Option<ScrollCommand> {
        let viewport = viewport?;
        (viewport.distance_from_bottom() <= self.live_edge_threshold_px)
            .then_some(ScrollCommand::ToBottom { animated: true })
    }
}

/// Reduces an absolute `next` URL to its path and query so it can be replayed against
/// the configured base URL. Relative cursors pass through; blanks mean no more pages.
pub fn normalize_cursor(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) => Some(match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        }),
        Err(_) if raw.starts_with('/') => Some(raw.to_string()),
        Err(_) => Some(format!("/{raw}")),
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
