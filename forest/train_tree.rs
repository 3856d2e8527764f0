/*!
Recursive induction of a single tree over one bootstrap replica. The replica's per-attribute sorted index arrays are partitioned in place at every split: instead of re-sorting, each attribute's sub-range is stably redistributed into a "below" prefix and an "above" suffix through a scratch buffer and a single copy back, so recursion costs O(range) per attribute. The builder owns its replica, its random generator, and scratch buffers sized once at the start of the build, so trees share nothing mutable and can be trained in parallel.
*/

use crate::cache::{Attribute, BootstrapSample};
use crate::choose_best_split::{choose_best_split, ChosenSplit, SplitScratch};
use crate::entropy::approx_eq;
use crate::{
	BranchNode, BranchSplit, BranchSplitEnum, BranchSplitNumber, LeafNode, Node, Tree,
};
use anyhow::{bail, Result};
use rand::Rng;
use rand_xoshiro::Xoshiro256Plus;
use std::ops::Range;

pub struct TrainTree {
	pub nodes: Vec<TrainNode>,
}

pub enum TrainNode {
	Branch(TrainBranchNode),
	Leaf(TrainLeafNode),
}

pub struct TrainBranchNode {
	pub left_child_index: Option<usize>,
	pub right_child_index: Option<usize>,
	pub split: BranchSplit,
	pub branch_proportions: [f64; 2],
}

pub struct TrainLeafNode {
	pub class_probabilities: Vec<f64>,
}

impl TrainNode {
	fn as_branch_mut(&mut self) -> Option<&mut TrainBranchNode> {
		match self {
			TrainNode::Branch(branch) => Some(branch),
			_ => None,
		}
	}
}

impl From<TrainTree> for Tree {
	fn from(tree: TrainTree) -> Tree {
		let nodes = tree
			.nodes
			.into_iter()
			.map(|node| match node {
				TrainNode::Branch(TrainBranchNode {
					left_child_index,
					right_child_index,
					split,
					branch_proportions,
				}) => Node::Branch(BranchNode {
					left_child_index: left_child_index.unwrap(),
					right_child_index: right_child_index.unwrap(),
					split,
					branch_proportions,
				}),
				TrainNode::Leaf(TrainLeafNode {
					class_probabilities,
				}) => Node::Leaf(LeafNode {
					class_probabilities,
				}),
			})
			.collect();
		Tree { nodes }
	}
}

/// Train one tree on its bootstrap replica. The replica and the generator are owned by this call, so nothing here touches another tree's state.
pub fn train_tree(
	sample: BootstrapSample,
	rng: Xoshiro256Plus,
	n_attributes_per_split: usize,
	max_depth: Option<usize>,
	min_instances_leaf: usize,
) -> Result<TrainTree> {
	let cache = sample.cache;
	let n_classes = cache.n_classes;
	// The root's class weight vector holds the replica weight of every in-bag instance. This is also where an out-of-range label surfaces as a task failure.
	let mut class_weights = vec![0.0; n_classes];
	for instance_index in 0..cache.n_instances {
		if !sample.in_bag[instance_index] {
			continue;
		}
		let label = cache.label(instance_index);
		match class_weights.get_mut(label) {
			Some(entry) => *entry += sample.weights[instance_index],
			None => bail!(
				"instance {} has class label {} but there are only {} classes",
				instance_index,
				label,
				n_classes,
			),
		}
	}
	let n_in_bag = sample.n_in_bag;
	let n_instances = cache.n_instances;
	let n_attributes = cache.n_attributes;
	let mut builder = TreeBuilder {
		sample,
		rng,
		nodes: Vec::new(),
		scratch: SplitScratch::new(n_classes),
		attribute_window: (0..n_attributes).collect(),
		branch_of: vec![0; n_instances],
		index_buffer: vec![0; n_in_bag],
		n_attributes_per_split,
		max_depth,
		min_instances_leaf,
	};
	builder.build_node(0..n_in_bag, class_weights, 0)?;
	Ok(TrainTree {
		nodes: builder.nodes,
	})
}

struct TreeBuilder<'a> {
	sample: BootstrapSample<'a>,
	rng: Xoshiro256Plus,
	nodes: Vec<TrainNode>,
	scratch: SplitScratch,
	attribute_window: Vec<usize>,
	/// The branch, 0 or 1, assigned to each instance by the split currently being applied.
	branch_of: Vec<u8>,
	/// Scratch for the stable redistribution of one attribute's sorted sub-range.
	index_buffer: Vec<u32>,
	n_attributes_per_split: usize,
	max_depth: Option<usize>,
	min_instances_leaf: usize,
}

impl<'a> TreeBuilder<'a> {
	/// Recursively build the node covering `range` of every sorted index array. Returns the index of the new node in `self.nodes`.
	fn build_node(
		&mut self,
		range: Range<usize>,
		class_weights: Vec<f64>,
		depth: usize,
	) -> Result<usize> {
		let n_in_range = range.len();
		let total_weight = self.range_weight(range.clone());
		// Too few instances, a pure node, or the depth limit all make a leaf.
		let is_small = n_in_range < usize::max(2, self.min_instances_leaf);
		let max_class_weight = class_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
		let is_pure = approx_eq(max_class_weight, class_weights.iter().sum());
		let is_deep = self.max_depth.map_or(false, |max_depth| depth >= max_depth);
		if is_small || is_pure || is_deep {
			return Ok(self.push_leaf(class_weights, total_weight, n_in_range));
		}
		let chosen = choose_best_split(
			&self.sample,
			range.clone(),
			&mut self.attribute_window,
			self.n_attributes_per_split,
			&mut self.scratch,
			&mut self.rng,
		);
		let chosen = match chosen {
			Some(chosen) => chosen,
			// No attribute achieved a sensible entropy reduction, so this node degrades to a leaf.
			None => return Ok(self.push_leaf(class_weights, total_weight, n_in_range)),
		};
		let middle = self.split_in_place(&chosen, range.clone());
		let split = match *self.sample.cache.attribute(chosen.attribute_index) {
			Attribute::Number => BranchSplit::Number(BranchSplitNumber {
				attribute_index: chosen.attribute_index,
				split_value: chosen.split_point,
			}),
			Attribute::Enum { .. } => BranchSplit::Enum(BranchSplitEnum {
				attribute_index: chosen.attribute_index,
				option_index: chosen.split_point as usize,
			}),
		};
		let node_index = self.nodes.len();
		self.nodes.push(TrainNode::Branch(TrainBranchNode {
			left_child_index: None,
			right_child_index: None,
			split,
			branch_proportions: chosen.proportions,
		}));
		let [mut left_class_weights, mut right_class_weights] = chosen.child_class_weights;
		// An empty branch can appear when every instance of a split-out category was missing or routed away. Such a child becomes a leaf holding the parent's normalized distribution.
		if middle == range.start || middle == range.end {
			let mut parent_distribution = class_weights;
			if total_weight > 0.0 {
				for entry in parent_distribution.iter_mut() {
					*entry /= total_weight;
				}
			}
			if middle == range.start {
				left_class_weights = parent_distribution;
			} else {
				right_class_weights = parent_distribution;
			}
		}
		let left_child_index = self.build_node(range.start..middle, left_class_weights, depth + 1)?;
		let right_child_index = self.build_node(middle..range.end, right_class_weights, depth + 1)?;
		let branch = self.nodes[node_index].as_branch_mut().unwrap();
		branch.left_child_index = Some(left_child_index);
		branch.right_child_index = Some(right_child_index);
		Ok(node_index)
	}

	/// Emit a leaf whose class weight vector is normalized by the total replica weight that reached it. An empty range keeps the back-filled parent distribution, which is already normalized.
	fn push_leaf(
		&mut self,
		mut class_weights: Vec<f64>,
		total_weight: f64,
		n_in_range: usize,
	) -> usize {
		if n_in_range != 0 && total_weight > 0.0 {
			for entry in class_weights.iter_mut() {
				*entry /= total_weight;
			}
		}
		let node_index = self.nodes.len();
		self.nodes.push(TrainNode::Leaf(TrainLeafNode {
			class_probabilities: class_weights,
		}));
		node_index
	}

	fn range_weight(&self, range: Range<usize>) -> f64 {
		if self.sample.cache.n_attributes == 0 {
			return 0.0;
		}
		self.sample.sorted_indices[0][range]
			.iter()
			.map(|&instance_index| self.sample.weights[instance_index as usize])
			.sum()
	}

	/// Decide a branch for every instance in range, then stably redistribute every attribute's sorted sub-range so that branch 0 occupies the prefix. Returns the first index of the branch 1 suffix. Instances missing the split attribute's value are routed to a branch at random, proportionally to the branch weights, with a fresh draw per instance.
	fn split_in_place(&mut self, chosen: &ChosenSplit, range: Range<usize>) -> usize {
		let cache = self.sample.cache;
		let is_enum = matches!(
			cache.attribute(chosen.attribute_index),
			Attribute::Enum { .. }
		);
		let mut n_below = 0;
		for &instance_index in self.sample.sorted_indices[chosen.attribute_index][range.clone()].iter() {
			let instance_index = instance_index as usize;
			let value = cache.value(chosen.attribute_index, instance_index);
			let branch = if value.is_nan() {
				if self.rng.gen::<f64>() > chosen.proportions[0] {
					1
				} else {
					0
				}
			} else if is_enum {
				if value as f64 == chosen.split_point {
					0
				} else {
					1
				}
			} else if (value as f64) < chosen.split_point {
				0
			} else {
				1
			};
			self.branch_of[instance_index] = branch;
			if branch == 0 {
				n_below += 1;
			}
		}
		for sorted in self.sample.sorted_indices.iter_mut() {
			let buffer = &mut self.index_buffer[..range.len()];
			let mut below = 0;
			let mut above = n_below;
			for &instance_index in sorted[range.clone()].iter() {
				if self.branch_of[instance_index as usize] == 0 {
					buffer[below] = instance_index;
					below += 1;
				} else {
					buffer[above] = instance_index;
					above += 1;
				}
			}
			sorted[range.clone()].copy_from_slice(buffer);
		}
		range.start + n_below
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cache::TrainingCache;
	use canopy_dataframe::{Column, DataFrameView, EnumColumn, EnumColumnView, NumberColumn};
	use canopy_progress::ProgressCounter;
	use rand::SeedableRng;
	use std::num::NonZeroUsize;

	fn cache_from(columns: Vec<Column>, labels: &[usize], n_classes: usize) -> TrainingCache {
		let label_options: Vec<String> = (0..n_classes).map(|c| format!("class{}", c)).collect();
		let label_data: Vec<Option<NonZeroUsize>> = labels
			.iter()
			.map(|&label| NonZeroUsize::new(label + 1))
			.collect();
		TrainingCache::from_dataframe(
			DataFrameView { columns: &columns },
			EnumColumnView {
				name: "label",
				options: &label_options,
				data: &label_data,
			},
			None,
			&ProgressCounter::new(columns.len() as u64),
		)
		.unwrap()
	}

	fn full_sample(cache: &TrainingCache) -> BootstrapSample {
		BootstrapSample {
			cache,
			weights: cache.weights().to_vec(),
			in_bag: vec![true; cache.n_instances],
			n_in_bag: cache.n_instances,
			sorted_indices: (0..cache.n_attributes)
				.map(|a| cache.sorted_indices(a).to_vec())
				.collect(),
		}
	}

	#[test]
	fn test_pure_node_makes_a_single_leaf() {
		let cache = cache_from(
			vec![Column::Number(NumberColumn {
				name: "a".to_owned(),
				data: vec![1.0, 2.0, 3.0, 4.0],
			})],
			&[1, 1, 1, 1],
			2,
		);
		let tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(1),
			1,
			None,
			1,
		)
		.unwrap();
		assert_eq!(tree.nodes.len(), 1);
		match &tree.nodes[0] {
			TrainNode::Leaf(leaf) => {
				assert!((leaf.class_probabilities[1] - 1.0).abs() < 1e-12);
				assert!(leaf.class_probabilities[0].abs() < 1e-12);
			}
			TrainNode::Branch(_) => panic!("expected a leaf"),
		}
	}

	#[test]
	fn test_split_point_separates_distinct_values() {
		// Three instances share each value, so the only legal boundary is between 0 and 1.
		let cache = cache_from(
			vec![Column::Number(NumberColumn {
				name: "a".to_owned(),
				data: vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
			})],
			&[0, 0, 0, 1, 1, 1],
			2,
		);
		let tree: Tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(1),
			1,
			None,
			1,
		)
		.unwrap()
		.into();
		let root = match &tree.nodes[0] {
			Node::Branch(branch) => branch,
			Node::Leaf(_) => panic!("expected a split at the root"),
		};
		match &root.split {
			BranchSplit::Number(split) => assert!((split.split_value - 0.5).abs() < 1e-12),
			BranchSplit::Enum(_) => panic!("expected a number split"),
		}
		assert!((root.branch_proportions[0] + root.branch_proportions[1] - 1.0).abs() < 1e-12);
	}

	#[test]
	fn test_leaf_probabilities_sum_to_one_on_complete_data() {
		let data: Vec<f32> = (0..40).map(|i| (i % 7) as f32 + (i as f32) * 0.01).collect();
		let other: Vec<f32> = (0..40).map(|i| ((i * 13) % 11) as f32).collect();
		let labels: Vec<usize> = (0..40).map(|i| if i % 3 == 0 { 0 } else { 1 }).collect();
		let cache = cache_from(
			vec![
				Column::Number(NumberColumn {
					name: "a".to_owned(),
					data,
				}),
				Column::Number(NumberColumn {
					name: "b".to_owned(),
					data: other,
				}),
			],
			&labels,
			2,
		);
		let tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(5),
			2,
			None,
			1,
		)
		.unwrap();
		for node in tree.nodes.iter() {
			match node {
				TrainNode::Leaf(leaf) => {
					let total: f64 = leaf.class_probabilities.iter().sum();
					assert!(
						(total - 1.0).abs() < 1e-9,
						"leaf probabilities summed to {}",
						total,
					);
				}
				TrainNode::Branch(branch) => {
					let total = branch.branch_proportions[0] + branch.branch_proportions[1];
					assert!((total - 1.0).abs() < 1e-9);
				}
			}
		}
	}

	#[test]
	fn test_max_depth_limits_the_tree() {
		let data: Vec<f32> = (0..64).map(|i| i as f32).collect();
		let labels: Vec<usize> = (0..64).map(|i| (i / 8) % 2).collect();
		let cache = cache_from(
			vec![Column::Number(NumberColumn {
				name: "a".to_owned(),
				data,
			})],
			&labels,
			2,
		);
		let tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(9),
			1,
			Some(2),
			1,
		)
		.unwrap();
		// A depth limit of 2 allows at most 3 branches and 4 leaves.
		assert!(tree.nodes.len() <= 7);
	}

	#[test]
	fn test_enum_split_is_one_vs_rest() {
		// Category 1 perfectly identifies class 1, so it should be split out.
		let cache = cache_from(
			vec![Column::Enum(EnumColumn {
				name: "a".to_owned(),
				options: vec!["p".to_owned(), "q".to_owned(), "r".to_owned()],
				data: vec![
					NonZeroUsize::new(1),
					NonZeroUsize::new(2),
					NonZeroUsize::new(3),
					NonZeroUsize::new(2),
					NonZeroUsize::new(1),
					NonZeroUsize::new(3),
					NonZeroUsize::new(2),
					NonZeroUsize::new(3),
				],
			})],
			&[0, 1, 0, 1, 0, 0, 1, 0],
			2,
		);
		let tree: Tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(1),
			1,
			None,
			1,
		)
		.unwrap()
		.into();
		let root = match &tree.nodes[0] {
			Node::Branch(branch) => branch,
			Node::Leaf(_) => panic!("expected a split at the root"),
		};
		match &root.split {
			BranchSplit::Enum(split) => assert_eq!(split.option_index, 1),
			BranchSplit::Number(_) => panic!("expected an enum split"),
		}
	}

	#[test]
	fn test_same_seed_builds_the_same_tree() {
		let data: Vec<f32> = (0..50).map(|i| ((i * 31) % 17) as f32).collect();
		let labels: Vec<usize> = (0..50).map(|i| (i % 5 == 0) as usize).collect();
		let cache = cache_from(
			vec![Column::Number(NumberColumn {
				name: "a".to_owned(),
				data,
			})],
			&labels,
			2,
		);
		let first: Tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(21),
			1,
			None,
			1,
		)
		.unwrap()
		.into();
		let second: Tree = train_tree(
			full_sample(&cache),
			Xoshiro256Plus::seed_from_u64(21),
			1,
			None,
			1,
		)
		.unwrap()
		.into();
		assert_eq!(first, second);
	}
}
