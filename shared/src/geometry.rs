use serde::{Deserialize, Serialize};

/// Direction of the cut that divides a partition into two children.
///
/// `Vertical` cuts along a vertical line (children are left/right halves),
/// `Horizontal` cuts along a horizontal line (children are top/bottom halves).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitAxis {
    Vertical,
    Horizontal,
}

impl SplitAxis {
    /// Even depths cut vertically, odd depths horizontally.
    pub fn for_depth(depth: u32) -> Self {
        if depth % 2 == 0 {
            SplitAxis::Vertical
        } else {
            SplitAxis::Horizontal
        }
    }
}

/// Axis-aligned rectangle with its origin at the minimum corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn max_x(&self) -> f32 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    /// Half-open containment: the minimum edges belong to the rectangle,
    /// the maximum edges belong to the neighbour.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.max_x() && y >= self.y && y < self.max_y()
    }

    /// Moves a point onto the rectangle, keeping it strictly inside the
    /// maximum edges so it resolves to exactly one half-open cell.
    pub fn clamp_point(&self, x: f32, y: f32) -> (f32, f32) {
        let cx = x.max(self.x).min(next_down(self.max_x()));
        let cy = y.max(self.y).min(next_down(self.max_y()));
        (cx, cy)
    }

    /// Returns the (low, high) halves of the rectangle cut along `axis`.
    pub fn halves(&self, axis: SplitAxis) -> (Rect, Rect) {
        match axis {
            SplitAxis::Vertical => {
                let half = self.width / 2.0;
                (
                    Rect::new(self.x, self.y, half, self.height),
                    Rect::new(self.x + half, self.y, self.width - half, self.height),
                )
            }
            SplitAxis::Horizontal => {
                let half = self.height / 2.0;
                (
                    Rect::new(self.x, self.y, self.width, half),
                    Rect::new(self.x, self.y + half, self.width, self.height - half),
                )
            }
        }
    }
}

fn next_down(value: f32) -> f32 {
    if value > 0.0 {
        f32::from_bits(value.to_bits() - 1)
    } else {
        value - f32::EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_axis_alternates_with_depth() {
        assert_eq!(SplitAxis::for_depth(0), SplitAxis::Vertical);
        assert_eq!(SplitAxis::for_depth(1), SplitAxis::Horizontal);
        assert_eq!(SplitAxis::for_depth(2), SplitAxis::Vertical);
    }

    #[test]
    fn test_vertical_halves() {
        let rect = Rect::new(0.0, 0.0, 800.0, 600.0);
        let (left, right) = rect.halves(SplitAxis::Vertical);
        assert_eq!(left, Rect::new(0.0, 0.0, 400.0, 600.0));
        assert_eq!(right, Rect::new(400.0, 0.0, 400.0, 600.0));
    }

    #[test]
    fn test_horizontal_halves() {
        let rect = Rect::new(400.0, 0.0, 400.0, 600.0);
        let (top, bottom) = rect.halves(SplitAxis::Horizontal);
        assert_eq!(top, Rect::new(400.0, 0.0, 400.0, 300.0));
        assert_eq!(bottom, Rect::new(400.0, 300.0, 400.0, 300.0));
    }

    #[test]
    fn test_containment_is_half_open() {
        let rect = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!(rect.contains(0.0, 0.0));
        assert!(rect.contains(9.99, 9.99));
        assert!(!rect.contains(10.0, 5.0));
        assert!(!rect.contains(5.0, 10.0));
    }

    #[test]
    fn test_clamp_point_stays_inside() {
        let rect = Rect::new(0.0, 0.0, 800.0, 600.0);
        let (x, y) = rect.clamp_point(900.0, -5.0);
        assert!(rect.contains(x, y));
        assert_approx_eq!(x, 800.0, 0.001);
        assert_eq!(y, 0.0);
    }
}
