/*!
The split search for one node. Attributes are drawn without replacement from a shrinking window until the configured number of attributes has been evaluated and at least one sensible split has been found, or the window is exhausted. Each candidate attribute is scored with a single linear pass over its sorted index range, moving instances across a running two-row contingency table and evaluating the conditional entropy at each boundary between two distinct values. A candidate only replaces the best split found so far at this node if it strictly improves the score, so the scan buffers for the best attribute survive in place until a better attribute overwrites them.
*/

use crate::cache::{Attribute, BootstrapSample};
use crate::entropy::{approx_eq, entropy_conditioned_on_rows, entropy_over_columns};
use rand::Rng;
use std::ops::Range;

/// A split must reduce the node's entropy by more than this amount to be considered sensible. The leeway compensates for the imprecision of the approximate logarithm.
pub const MIN_GAIN_TO_SPLIT: f64 = 1e-2;

/// Scratch tables reused by every node of one tree, sized once from the class count when the tree build starts.
pub struct SplitScratch {
	/// The contingency table of the attribute being scanned, with the missing weight already distributed. Row 0 holds the instances below the split.
	dist: [Vec<f64>; 2],
	/// The running table advanced across candidate boundaries during the scan.
	running_dist: [Vec<f64>; 2],
	/// The fraction of non-missing weight in each row of `dist`.
	proportions: [f64; 2],
}

impl SplitScratch {
	pub fn new(n_classes: usize) -> SplitScratch {
		SplitScratch {
			dist: [vec![0.0; n_classes], vec![0.0; n_classes]],
			running_dist: [vec![0.0; n_classes], vec![0.0; n_classes]],
			proportions: [0.0; 2],
		}
	}
}

/// The winning split for a node. `split_point` is a threshold for number attributes and a zero-based option index for enum attributes.
pub struct ChosenSplit {
	pub attribute_index: usize,
	pub split_point: f64,
	pub proportions: [f64; 2],
	/// The two rows of the winning contingency table, which become the children's initial class weight vectors.
	pub child_class_weights: [Vec<f64>; 2],
}

/// Search for the best split over randomly drawn attributes. Returns `None` if no attribute achieves a sensible entropy reduction, in which case the caller emits a leaf.
pub fn choose_best_split(
	sample: &BootstrapSample,
	range: Range<usize>,
	attribute_window: &mut [usize],
	n_attributes_per_split: usize,
	scratch: &mut SplitScratch,
	rng: &mut impl Rng,
) -> Option<ChosenSplit> {
	let n_classes = sample.cache.n_classes;
	let mut window_size = attribute_window.len();
	let mut remaining_draws = n_attributes_per_split;
	let mut sensible_split_found = false;
	let mut best_score = f64::NEG_INFINITY;
	let mut best_attribute_index = None;
	let mut best_split_point = f64::NAN;
	let mut best_proportions = [0.0; 2];
	let mut best_dist = [vec![0.0; n_classes], vec![0.0; n_classes]];
	let mut prior = None;
	while window_size > 0 && (remaining_draws > 0 || !sensible_split_found) {
		remaining_draws = remaining_draws.saturating_sub(1);
		// Swap the drawn attribute to the dead end of the window so it is tried at most once per node.
		let drawn = rng.gen_range(0, window_size);
		let attribute_index = attribute_window[drawn];
		attribute_window.swap(drawn, window_size - 1);
		window_size -= 1;
		let candidate = score_attribute(sample, attribute_index, range.clone(), scratch, best_score);
		let (split_point, score) = match candidate {
			Some(candidate) => candidate,
			None => continue,
		};
		// This candidate improved on every attribute tried so far at this node.
		best_attribute_index = Some(attribute_index);
		best_split_point = split_point;
		best_score = score;
		best_proportions = scratch.proportions;
		best_dist[0].clone_from_slice(&scratch.dist[0]);
		best_dist[1].clone_from_slice(&scratch.dist[1]);
		// The prior entropy is the same for every attribute, because the column totals of the table always hold the full class weights of the range, missing weight included.
		let prior_entropy = *prior.get_or_insert_with(|| entropy_over_columns(&best_dist));
		if prior_entropy + score > MIN_GAIN_TO_SPLIT {
			sensible_split_found = true;
		}
	}
	if sensible_split_found {
		Some(ChosenSplit {
			attribute_index: best_attribute_index.unwrap(),
			split_point: best_split_point,
			proportions: best_proportions,
			child_class_weights: best_dist,
		})
	} else {
		None
	}
}

/// Score one attribute over the sorted index range. On success the winning contingency table and branch proportions are left in `scratch` and the split point and score are returned. Returns `None` when every value in range is missing, when no boundary between distinct values exists, or when the score does not improve on `best_score`.
fn score_attribute(
	sample: &BootstrapSample,
	attribute_index: usize,
	range: Range<usize>,
	scratch: &mut SplitScratch,
	best_score: f64,
) -> Option<(f64, f64)> {
	let cache = sample.cache;
	let sorted = &sample.sorted_indices[attribute_index][range];
	// Missing values always occupy the suffix of the range.
	let mut n_non_missing = sorted.len();
	while n_non_missing > 0
		&& cache.is_missing(attribute_index, sorted[n_non_missing - 1] as usize)
	{
		n_non_missing -= 1;
	}
	if n_non_missing == 0 {
		return None;
	}
	let (non_missing, missing) = sorted.split_at(n_non_missing);
	for row in scratch.dist.iter_mut() {
		for entry in row.iter_mut() {
			*entry = 0.0;
		}
	}
	let split_point = match *cache.attribute(attribute_index) {
		Attribute::Enum { n_options } if n_options <= 2 => {
			// With at most two categories there is nothing to search. Category 0 is split out.
			for &instance_index in non_missing.iter() {
				let instance_index = instance_index as usize;
				let row = cache.value(attribute_index, instance_index) as usize;
				scratch.dist[row][cache.label(instance_index)] += sample.weights[instance_index];
			}
			0.0
		}
		Attribute::Enum { .. } => {
			// One-vs-rest search. The range is sorted by option index, so each category is one contiguous run. Start with every instance below the split.
			for &instance_index in non_missing.iter() {
				let instance_index = instance_index as usize;
				scratch.dist[1][cache.label(instance_index)] += sample.weights[instance_index];
			}
			let mut best_value = f64::NEG_INFINITY;
			let mut best_option = 0;
			let mut run_start = 0;
			while run_start < n_non_missing {
				let option = cache.value(attribute_index, non_missing[run_start] as usize) as usize;
				let mut run_end = run_start;
				while run_end < n_non_missing
					&& cache.value(attribute_index, non_missing[run_end] as usize) as usize
						== option
				{
					run_end += 1;
				}
				// Split this category out against all the others.
				scratch.running_dist[0].iter_mut().for_each(|entry| *entry = 0.0);
				scratch.running_dist[1].clone_from_slice(&scratch.dist[1]);
				for &instance_index in non_missing[run_start..run_end].iter() {
					let instance_index = instance_index as usize;
					let label = cache.label(instance_index);
					let weight = sample.weights[instance_index];
					scratch.running_dist[0][label] += weight;
					scratch.running_dist[1][label] -= weight;
				}
				let value = -entropy_conditioned_on_rows(&scratch.running_dist);
				if value > best_value {
					best_value = value;
					best_option = option;
				}
				run_start = run_end;
			}
			// Rebuild the table for the winning category.
			for &instance_index in non_missing.iter() {
				let instance_index = instance_index as usize;
				if cache.value(attribute_index, instance_index) as usize == best_option {
					let label = cache.label(instance_index);
					let weight = sample.weights[instance_index];
					scratch.dist[0][label] += weight;
					scratch.dist[1][label] -= weight;
				}
			}
			best_option as f64
		}
		Attribute::Number => {
			// Begin with every instance below the split, then move instances across as the scan advances.
			for row in scratch.running_dist.iter_mut() {
				for entry in row.iter_mut() {
					*entry = 0.0;
				}
			}
			for &instance_index in non_missing.iter() {
				let instance_index = instance_index as usize;
				scratch.running_dist[1][cache.label(instance_index)] +=
					sample.weights[instance_index];
			}
			scratch.dist[0].clone_from_slice(&scratch.running_dist[0]);
			scratch.dist[1].clone_from_slice(&scratch.running_dist[1]);
			let mut best_value = f64::NEG_INFINITY;
			let mut best_boundary = 0;
			for i in 1..n_non_missing {
				let instance_index = non_missing[i] as usize;
				let previous_index = non_missing[i - 1] as usize;
				let label = cache.label(previous_index);
				let weight = sample.weights[previous_index];
				scratch.running_dist[0][label] += weight;
				scratch.running_dist[1][label] -= weight;
				// Never place a boundary between two instances with equal values.
				if cache.value(attribute_index, instance_index)
					> cache.value(attribute_index, previous_index)
				{
					let value = -entropy_conditioned_on_rows(&scratch.running_dist);
					if value > best_value {
						best_value = value;
						best_boundary = i;
					}
				}
			}
			if best_boundary == 0 {
				// All values in range are equal, so there is no boundary to split at.
				return None;
			}
			for &instance_index in non_missing[..best_boundary].iter() {
				let instance_index = instance_index as usize;
				let label = cache.label(instance_index);
				let weight = sample.weights[instance_index];
				scratch.dist[0][label] += weight;
				scratch.dist[1][label] -= weight;
			}
			let below = cache.value(attribute_index, non_missing[best_boundary - 1] as usize);
			let above = cache.value(attribute_index, non_missing[best_boundary] as usize);
			(below as f64 + above as f64) / 2.0
		}
	};
	// The branch proportions come from the non-missing weight only.
	let row_totals = [
		scratch.dist[0].iter().sum::<f64>(),
		scratch.dist[1].iter().sum::<f64>(),
	];
	let total = row_totals[0] + row_totals[1];
	if approx_eq(total, 0.0) {
		scratch.proportions = [0.5, 0.5];
	} else {
		scratch.proportions = [row_totals[0] / total, row_totals[1] / total];
	}
	// Distribute the weight of the missing instances into both rows, proportionally to the branch weights. They affect the reported score here but are routed to a single branch only at partition time.
	for &instance_index in missing.iter() {
		let instance_index = instance_index as usize;
		let label = cache.label(instance_index);
		let weight = sample.weights[instance_index];
		scratch.dist[0][label] += scratch.proportions[0] * weight;
		scratch.dist[1][label] += scratch.proportions[1] * weight;
	}
	let score = -entropy_conditioned_on_rows(&scratch.dist);
	if score > best_score {
		Some((split_point, score))
	} else {
		None
	}
}
