/*!
Out-of-bag evaluation. Each instance gets one read-only vote collection task: it walks the trees whose bootstrap replica excluded the instance, sums their class distributions, and takes the arg-max. The tasks run in parallel because trees and in-bag bitmaps are immutable once training finishes; a join barrier precedes the weighted aggregation of the scalar error.
*/

use crate::cache::TrainingCache;
use crate::{max_index, Tree};
use anyhow::{bail, Result};
use canopy_metrics::{ClassificationError, StreamingMetric};
use itertools::izip;
use rayon::prelude::*;

/// Collect the out-of-bag vote for one instance. Returns `None` when the instance is in-bag for every tree, or when the summed distribution carries no weight, so that degenerate votes can be excluded from the error's denominator.
pub fn collect_out_of_bag_vote(
	trees: &[Tree],
	in_bag: &[Vec<bool>],
	cache: &TrainingCache,
	instance_index: usize,
) -> Option<usize> {
	let mut distribution = vec![0.0; cache.n_classes];
	let mut has_out_of_bag_tree = false;
	for (tree, in_bag) in izip!(trees.iter(), in_bag.iter()) {
		if in_bag[instance_index] {
			continue;
		}
		has_out_of_bag_tree = true;
		tree.accumulate_distribution_for_cached_instance(
			0,
			cache,
			instance_index,
			1.0,
			&mut distribution,
		);
	}
	if !has_out_of_bag_tree {
		return None;
	}
	if distribution.iter().sum::<f64>() <= 0.0 {
		return None;
	}
	Some(max_index(&distribution))
}

/// Compute the weighted out-of-bag error over all instances, one parallel task per instance. Instances without a valid vote do not count toward the denominator. Fails if no instance has an out-of-bag tree at all, which can happen with very small forests.
pub fn compute_out_of_bag_error(
	cache: &TrainingCache,
	trees: &[Tree],
	in_bag: &[Vec<bool>],
	progress: &(dyn Fn() + Sync),
) -> Result<f64> {
	let votes: Vec<Option<usize>> = (0..cache.n_instances)
		.into_par_iter()
		.map(|instance_index| {
			let vote = collect_out_of_bag_vote(trees, in_bag, cache, instance_index);
			progress();
			vote
		})
		.collect();
	let mut error = ClassificationError::new();
	for (vote, label, weight) in izip!(votes.iter(), cache.labels().iter(), cache.weights().iter())
	{
		if let Some(predicted) = vote {
			error.update((*predicted, *label, *weight));
		}
	}
	match error.finalize() {
		Some(error) => Ok(error),
		None => bail!(
			"no instance was out of bag for any of the {} trees; grow more trees",
			trees.len(),
		),
	}
}
