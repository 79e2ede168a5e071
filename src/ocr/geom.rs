use super::BoxPx;

/// Intersection area over the area of the smaller box.
/// Catches a clipped copy of a line sitting inside the full line, which
/// plain IoU scores low.
pub fn overlap_ratio(a: &BoxPx, b: &BoxPx) -> f32 {
    let inter = intersection_area(a, b);
    if inter == 0 {
        return 0.0;
    }
    let smaller = a.area().min(b.area()).max(1);
    inter as f32 / smaller as f32
}

pub fn intersection_area(a: &BoxPx, b: &BoxPx) -> u64 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    if ix2 <= ix1 || iy2 <= iy1 {
        return 0;
    }
    (ix2 - ix1) as u64 * (iy2 - iy1) as u64
}

pub fn horizontal_overlap_ratio(a: &BoxPx, b: &BoxPx) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let ix2 = a.x2.min(b.x2);
    if ix2 <= ix1 {
        return 0.0;
    }
    (ix2 - ix1) as f32 / (a.width().min(b.width()) as f32).max(1.0)
}

/// Signed horizontal distance from the right edge of `left` to the left edge of `right`.
pub fn horizontal_gap(left: &BoxPx, right: &BoxPx) -> i64 {
    right.x1 as i64 - left.x2 as i64
}

/// Signed vertical distance from the bottom of `upper` to the top of `lower`.
pub fn vertical_gap(upper: &BoxPx, lower: &BoxPx) -> i64 {
    lower.y1 as i64 - upper.y2 as i64
}

pub fn union_box(a: &BoxPx, b: &BoxPx) -> BoxPx {
    BoxPx {
        x1: a.x1.min(b.x1),
        y1: a.y1.min(b.y1),
        x2: a.x2.max(b.x2),
        y2: a.y2.max(b.y2),
    }
}
