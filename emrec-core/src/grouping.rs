//! Candidate post-processing shared by the detectors.
//!
//! The cascade produces many overlapping hits per face; [`group_rectangles`] clusters
//! them and keeps clusters with enough support. The YuNet detector uses
//! [`non_max_suppression`] on scored boxes instead.

use std::cmp::Ordering;

use crate::detector::FaceRect;

/// Relative tolerance used when clustering cascade hits.
pub const GROUP_EPS: f64 = 0.2;

/// Cluster similar rectangles and keep clusters with more than `min_neighbors` members.
///
/// Each surviving cluster is replaced by its rounded average. Clusters that sit inside
/// a better supported cluster are dropped. With `min_neighbors == 0` the input is
/// returned unchanged.
pub fn group_rectangles(rects: &[FaceRect], min_neighbors: u32, eps: f64) -> Vec<FaceRect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, class_count) = partition(rects, |a, b| similar(a, b, eps));

    let mut sums = vec![[0i64; 4]; class_count];
    let mut weights = vec![0u32; class_count];
    for (rect, &class) in rects.iter().zip(&labels) {
        let sum = &mut sums[class];
        sum[0] += i64::from(rect.x);
        sum[1] += i64::from(rect.y);
        sum[2] += i64::from(rect.width);
        sum[3] += i64::from(rect.height);
        weights[class] += 1;
    }

    let averaged: Vec<FaceRect> = sums
        .iter()
        .zip(&weights)
        .map(|(sum, &count)| {
            let scale = 1.0 / f64::from(count);
            FaceRect::new(
                round(sum[0] as f64 * scale),
                round(sum[1] as f64 * scale),
                round(sum[2] as f64 * scale),
                round(sum[3] as f64 * scale),
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = weights[i];
        if n1 <= min_neighbors {
            continue;
        }

        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = weights[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = round(f64::from(r2.width) * eps);
            let dy = round(f64::from(r2.height) * eps);
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            grouped.push(*r1);
        }
    }
    grouped
}

/// Two boxes are similar when all four edges lie within a size-relative tolerance.
fn similar(a: &FaceRect, b: &FaceRect, eps: f64) -> bool {
    let delta = eps * f64::from(a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    f64::from((a.x - b.x).abs()) <= delta
        && f64::from((a.y - b.y).abs()) <= delta
        && f64::from((a.x + a.width - b.x - b.width).abs()) <= delta
        && f64::from((a.y + a.height - b.y - b.height).abs()) <= delta
}

/// Split `items` into equivalence classes of the transitive closure of `same`.
///
/// Returns per-item class labels, numbered in order of first appearance, and the
/// class count.
fn partition<T>(items: &[T], same: impl Fn(&T, &T) -> bool) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..items.len()).collect();

    fn find(parent: &mut [usize], mut node: usize) -> usize {
        while parent[node] != node {
            parent[node] = parent[parent[node]];
            node = parent[node];
        }
        node
    }

    for i in 0..items.len() {
        for j in 0..i {
            if same(&items[i], &items[j]) {
                let root_i = find(&mut parent, i);
                let root_j = find(&mut parent, j);
                if root_i != root_j {
                    parent[root_i.max(root_j)] = root_i.min(root_j);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; items.len()];
    let mut labels = Vec::with_capacity(items.len());
    let mut classes = 0;
    for i in 0..items.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, classes)
}

/// Round half to even, matching the integer conversion used for averaged boxes.
fn round(value: f64) -> i32 {
    value.round_ties_even() as i32
}

/// A box with a confidence score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredRect {
    pub rect: FaceRect,
    pub score: f32,
}

/// Sort by descending score, truncate to `top_k` (0 keeps all) and suppress overlaps.
pub fn non_max_suppression(
    mut candidates: Vec<ScoredRect>,
    iou_threshold: f32,
    top_k: usize,
) -> Vec<ScoredRect> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    if top_k > 0 && candidates.len() > top_k {
        candidates.truncate(top_k);
    }
    if iou_threshold <= 0.0 {
        return candidates;
    }

    let mut kept: Vec<ScoredRect> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept
            .iter()
            .all(|existing| candidate.rect.iou(&existing.rect) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}
