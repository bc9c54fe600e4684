//! Density-based clustering of unlabeled faces.
//!
//! DBSCAN over the distance of an [`EmbeddingSpace`] (Euclidean for every
//! shipped model). Neighbor discovery walks points in index order, so the
//! same input always yields the same clusters in the same order. Points that
//! end up as noise are returned as singleton clusters.

use crate::provider::EmbeddingSpace;
use crate::store::FaceStore;
use crate::types::{FaceEncoding, FaceId};
use std::collections::VecDeque;

const UNVISITED: i32 = 0;
const NOISE: i32 = -1;

/// Group `encodings` into identity clusters.
///
/// Two points are neighbors when their distance is `<= threshold`. With
/// `min_samples <= 1` every point is a core point and clusters are exactly the
/// connected components of the neighbor graph.
///
/// Returns index lists into `encodings`: members ascending, clusters largest
/// first, equal sizes ordered by their smallest member.
pub fn cluster<S: EmbeddingSpace + ?Sized>(
    space: &S,
    encodings: &[&FaceEncoding],
    threshold: f32,
    min_samples: usize,
) -> Vec<Vec<usize>> {
    let labels = dbscan(space, encodings, threshold, min_samples.max(1));

    let cluster_count = labels.iter().copied().max().unwrap_or(0).max(0) as usize;
    let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (i, &label) in labels.iter().enumerate() {
        if label > 0 {
            clusters[label as usize - 1].push(i);
        } else {
            clusters.push(vec![i]);
        }
    }

    for members in &mut clusters {
        members.sort_unstable();
    }
    clusters.retain(|members| !members.is_empty());
    clusters.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
    clusters
}

/// Cluster the store's unlabeled backlog, returning stable face ids.
pub fn cluster_store<S: EmbeddingSpace + ?Sized>(
    store: &FaceStore,
    space: &S,
    threshold: f32,
    min_samples: usize,
) -> Vec<Vec<FaceId>> {
    let (ids, encodings): (Vec<FaceId>, Vec<&FaceEncoding>) = store
        .unlabeled()
        .map(|(id, face)| (id, &face.encoding))
        .unzip();

    cluster(space, &encodings, threshold, min_samples)
        .into_iter()
        .map(|members| members.into_iter().map(|i| ids[i]).collect())
        .collect()
}

/// Label every point: positive cluster ids starting at 1, or [`NOISE`].
fn dbscan<S: EmbeddingSpace + ?Sized>(space: &S, points: &[&FaceEncoding], eps: f32, min_pts: usize) -> Vec<i32> {
    let mut labels = vec![UNVISITED; points.len()];
    let mut cluster_id: i32 = 0;

    for i in 0..points.len() {
        if labels[i] != UNVISITED {
            continue;
        }

        let neighbors = range_query(space, points, i, eps);
        if neighbors.len() < min_pts {
            labels[i] = NOISE;
            continue;
        }

        cluster_id += 1;
        labels[i] = cluster_id;

        let mut seeds: VecDeque<usize> = neighbors.into_iter().filter(|&j| j != i).collect();
        while let Some(q) = seeds.pop_front() {
            if labels[q] == NOISE {
                // Border point: joins the cluster but does not expand it.
                labels[q] = cluster_id;
                continue;
            }
            if labels[q] != UNVISITED {
                continue;
            }
            labels[q] = cluster_id;

            let q_neighbors = range_query(space, points, q, eps);
            if q_neighbors.len() >= min_pts {
                seeds.extend(q_neighbors.into_iter().filter(|&j| labels[j] == UNVISITED || labels[j] == NOISE));
            }
        }
    }

    labels
}

/// Indices of all points within `eps` of `points[idx]`, including itself.
fn range_query<S: EmbeddingSpace + ?Sized>(space: &S, points: &[&FaceEncoding], idx: usize, eps: f32) -> Vec<usize> {
    let q = points[idx];
    points
        .iter()
        .enumerate()
        .filter(|(_, p)| space.distance(q, p) <= eps)
        .map(|(i, _)| i)
        .collect()
}
