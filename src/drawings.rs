//! Drawing-tool interaction state machine.
//!
//! Maps pointer events in (time, price) space to persisted drawing
//! objects. Anchors are stored in series-native (unscaled) units so they
//! stay valid across scale-mode toggles; rendering re-projects them
//! through the same transform as the candles. Drawings are independent of
//! candle data and persist across instrument switches unless cleared.

/// Active tool. `Cursor` is the terminal state after every finalised or
/// cancelled drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawingTool {
    #[default]
    Cursor,
    Crosshair,
    HorizontalLine,
    TrendLine,
    Ray,
}

impl DrawingTool {
    /// Anchors required to finalise a drawing with this tool
    fn anchors_required(&self) -> usize {
        match self {
            DrawingTool::Cursor | DrawingTool::Crosshair => 0,
            DrawingTool::HorizontalLine => 1,
            DrawingTool::TrendLine | DrawingTool::Ray => 2,
        }
    }

    fn is_drawing_tool(&self) -> bool {
        self.anchors_required() > 0
    }
}

/// A user-placed annotation anchored to (time, price) coordinates.
///
/// Immutable once finalised except through explicit delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Drawing {
    pub id: u64,
    pub tool: DrawingTool,
    /// Series-native (unscaled) anchors: one for a horizontal line, two
    /// for trend lines and rays. A horizontal line's anchor time is
    /// irrelevant; only its price is fixed.
    pub anchors: Vec<(i64, f64)>,
    pub color: String,
}

/// Pointer/tool event state machine producing [`Drawing`]s.
#[derive(Debug)]
pub struct DrawingManager {
    tool: DrawingTool,
    pending: Vec<(i64, f64)>,
    drawings: Vec<Drawing>,
    next_id: u64,
    color: String,
    /// When true the tool stays armed after finalising for rapid
    /// multi-draw; when false every drawing is single-shot. Deterministic
    /// per configuration, never per timing.
    sticky: bool,
}

impl Default for DrawingManager {
    fn default() -> Self {
        Self {
            tool: DrawingTool::Cursor,
            pending: Vec::new(),
            drawings: Vec::new(),
            next_id: 1,
            color: "#2962ff".to_string(),
            sticky: false,
        }
    }
}

impl DrawingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sticky_tools(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn active_tool(&self) -> DrawingTool {
        self.tool
    }

    pub fn set_color(&mut self, color: impl Into<String>) {
        self.color = color.into();
    }

    /// Select a tool; any half-finished drawing is discarded.
    pub fn select_tool(&mut self, tool: DrawingTool) {
        self.tool = tool;
        self.pending.clear();
    }

    /// Cancel input (Escape): always returns to `Cursor` and drops any
    /// pending anchor.
    pub fn cancel(&mut self) {
        self.tool = DrawingTool::Cursor;
        self.pending.clear();
    }

    /// Feed one coordinate event.
    ///
    /// Returns the finalised drawing when the active tool has collected
    /// enough anchors; otherwise arms a pending anchor and returns `None`.
    pub fn pointer(&mut self, time: i64, price: f64) -> Option<Drawing> {
        if !self.tool.is_drawing_tool() {
            return None;
        }

        self.pending.push((time, price));
        if self.pending.len() < self.tool.anchors_required() {
            return None;
        }

        let drawing = Drawing {
            id: self.next_id,
            tool: self.tool,
            anchors: std::mem::take(&mut self.pending),
            color: self.color.clone(),
        };
        self.next_id += 1;
        self.drawings.push(drawing.clone());

        if !self.sticky {
            self.tool = DrawingTool::Cursor;
        }

        Some(drawing)
    }

    /// Remove one drawing by id; candle data is unaffected.
    pub fn delete(&mut self, id: u64) -> bool {
        let before = self.drawings.len();
        self.drawings.retain(|drawing| drawing.id != id);
        self.drawings.len() != before
    }

    /// Remove all drawings; candle data is unaffected.
    pub fn clear(&mut self) {
        self.drawings.clear();
        self.pending.clear();
    }

    pub fn drawings(&self) -> &[Drawing] {
        &self.drawings
    }

    /// The armed anchor of a two-point tool, for preview rendering
    pub fn pending_anchor(&self) -> Option<(i64, f64)> {
        self.pending.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizontal_line_finalises_on_one_anchor() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::HorizontalLine);

        let drawing = manager.pointer(10, 5.0).expect("finalised");
        assert_eq!(drawing.tool, DrawingTool::HorizontalLine);
        assert_eq!(drawing.anchors, vec![(10, 5.0)]);
        assert_eq!(manager.active_tool(), DrawingTool::Cursor);
        assert_eq!(manager.drawings().len(), 1);
    }

    #[test]
    fn trend_line_takes_two_clicks_then_returns_to_cursor() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::TrendLine);

        assert!(manager.pointer(10, 5.0).is_none());
        assert_eq!(manager.pending_anchor(), Some((10, 5.0)));

        let drawing = manager.pointer(20, 8.0).expect("finalised");
        assert_eq!(drawing.anchors, vec![(10, 5.0), (20, 8.0)]);
        assert_eq!(manager.active_tool(), DrawingTool::Cursor);
    }

    #[test]
    fn ray_requires_two_anchors() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::Ray);
        assert!(manager.pointer(100, 1.0).is_none());
        let drawing = manager.pointer(160, 2.0).unwrap();
        assert_eq!(drawing.tool, DrawingTool::Ray);
        assert_eq!(drawing.anchors.len(), 2);
    }

    #[test]
    fn sticky_mode_keeps_the_tool_armed() {
        let mut manager = DrawingManager::new().with_sticky_tools(true);
        manager.select_tool(DrawingTool::HorizontalLine);

        manager.pointer(10, 1.0).unwrap();
        assert_eq!(manager.active_tool(), DrawingTool::HorizontalLine);
        manager.pointer(20, 2.0).unwrap();
        assert_eq!(manager.drawings().len(), 2);
    }

    #[test]
    fn cancel_always_returns_to_cursor() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::TrendLine);
        manager.pointer(10, 5.0);

        manager.cancel();
        assert_eq!(manager.active_tool(), DrawingTool::Cursor);
        assert_eq!(manager.pending_anchor(), None);

        // The dropped anchor never becomes half a drawing
        manager.select_tool(DrawingTool::TrendLine);
        assert!(manager.pointer(30, 1.0).is_none());
    }

    #[test]
    fn tool_switch_discards_pending_anchor() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::TrendLine);
        manager.pointer(10, 5.0);

        manager.select_tool(DrawingTool::HorizontalLine);
        let drawing = manager.pointer(50, 3.0).unwrap();
        assert_eq!(drawing.anchors, vec![(50, 3.0)]);
    }

    #[test]
    fn cursor_and_crosshair_ignore_pointer_events() {
        let mut manager = DrawingManager::new();
        assert!(manager.pointer(10, 5.0).is_none());

        manager.select_tool(DrawingTool::Crosshair);
        assert!(manager.pointer(10, 5.0).is_none());
        assert!(manager.drawings().is_empty());
    }

    #[test]
    fn delete_removes_by_id_only() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::HorizontalLine);
        let first = manager.pointer(10, 1.0).unwrap();
        manager.select_tool(DrawingTool::HorizontalLine);
        let second = manager.pointer(20, 2.0).unwrap();

        assert!(manager.delete(first.id));
        assert!(!manager.delete(first.id));
        assert_eq!(manager.drawings().len(), 1);
        assert_eq!(manager.drawings()[0].id, second.id);
    }

    #[test]
    fn clear_removes_everything() {
        let mut manager = DrawingManager::new();
        manager.select_tool(DrawingTool::HorizontalLine);
        manager.pointer(10, 1.0);
        manager.clear();
        assert!(manager.drawings().is_empty());
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut manager = DrawingManager::new().with_sticky_tools(true);
        manager.select_tool(DrawingTool::HorizontalLine);
        let a = manager.pointer(1, 1.0).unwrap();
        let b = manager.pointer(2, 2.0).unwrap();
        let c = manager.pointer(3, 3.0).unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }
}
