/*!
This crate implements a random forest classifier: bagged ensembles of randomized decision trees with out-of-bag evaluation and permutation feature importance, written in pure Rust. Training works over a pre-sorted columnar cache that is shared by every tree, bootstrap replicas are trained in parallel on a worker pool, and instances with missing feature values are routed probabilistically both during training and at prediction time.

Callers assemble their data into `canopy_dataframe` columns, call [`train`](fn.train.html), and read predictions and diagnostics off the returned [`Forest`](struct.Forest.html).
*/

#![allow(clippy::tabs_in_doc_comments)]

mod cache;
mod choose_best_split;
mod entropy;
mod feature_importances;
mod oob;
mod train;
mod train_tree;

pub use self::cache::{Attribute, BootstrapSample, TrainingCache};
pub use self::choose_best_split::MIN_GAIN_TO_SPLIT;
pub use self::train::{train, Progress};

use canopy_dataframe::Value;
use serde::{Deserialize, Serialize};

/// These are the options passed to [`train`](fn.train.html).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainOptions {
	/// The number of trees in the forest.
	pub n_trees: usize,
	/// The number of randomly chosen attributes evaluated at each node. `None` chooses `floor(log2(n_attributes)) + 1`. A node keeps drawing beyond this count until it finds at least one sensible split or runs out of attributes.
	pub attributes_per_split: Option<usize>,
	/// The depth of a single tree will never exceed this value. `None` leaves the depth unbounded.
	pub max_depth: Option<usize>,
	/// A node with fewer than `max(2, min_instances_leaf)` instances becomes a leaf.
	pub min_instances_leaf: usize,
	/// The size of each bootstrap replica as a percentage of the training set size. Must be 100 if the out-of-bag error or the feature importances are requested.
	pub bag_size_percent: usize,
	/// Whether to compute the out-of-bag error after training.
	pub compute_out_of_bag_error: bool,
	/// Whether to compute permutation feature importances after training. This implies computing the out-of-bag error, which serves as the baseline.
	pub compute_feature_importances: bool,
	/// The number of worker threads. `None` uses the available hardware parallelism.
	pub n_threads: Option<usize>,
	/// The seed for the master random generator. Replicas and per-tree generators are derived from it deterministically, so a fixed seed reproduces the same forest.
	pub seed: u64,
}

impl Default for TrainOptions {
	fn default() -> TrainOptions {
		TrainOptions {
			n_trees: 100,
			attributes_per_split: None,
			max_depth: None,
			min_instances_leaf: 1,
			bag_size_percent: 100,
			compute_out_of_bag_error: true,
			compute_feature_importances: false,
			n_threads: None,
			seed: 42,
		}
	}
}

/// A trained forest, its per-tree in-bag bitmaps, and the diagnostics that were requested at training time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forest {
	pub trees: Vec<Tree>,
	/// `in_bag[tree][instance]` is true iff the instance was drawn into that tree's bootstrap replica. Fixed once the tree finishes training.
	pub in_bag: Vec<Vec<bool>>,
	/// The names of the classes, taken from the label column's options.
	pub classes: Vec<String>,
	pub n_classes: usize,
	/// The weighted out-of-bag misclassification rate, if requested.
	pub out_of_bag_error: Option<f64>,
	/// Per-attribute permutation importances, if requested: the increase in out-of-bag error when that attribute's column is scrambled.
	pub feature_importances: Option<Vec<f64>>,
}

/// Trees are stored as a `Vec` of `Node`s. Each branch holds two indexes into the `Vec`, one for each of its children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
	pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
	Branch(BranchNode),
	Leaf(LeafNode),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
	/// The index in the tree's node vector of the child taking instances below the split.
	pub left_child_index: usize,
	/// The index in the tree's node vector of the child taking instances above the split.
	pub right_child_index: usize,
	pub split: BranchSplit,
	/// The fractions of non-missing training weight that went to each child. They sum to one and are used to route instances whose split attribute value is missing.
	pub branch_proportions: [f64; 2],
}

/// A split on a number attribute compares against a threshold; a split on an enum attribute tests membership of a single split-out option against all the others.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BranchSplit {
	Number(BranchSplitNumber),
	Enum(BranchSplitEnum),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchSplitNumber {
	pub attribute_index: usize,
	/// Instances with a value strictly below this threshold go left.
	pub split_value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchSplitEnum {
	pub attribute_index: usize,
	/// Instances whose value equals this zero-based option index go left, every other option goes right.
	pub option_index: usize,
}

/// The leaves hold class weight vectors normalized by the training weight that reached them. On complete, unit-weight data each vector sums to one; missing-value fan-out during training can shift the sum slightly, which is intentional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafNode {
	pub class_probabilities: Vec<f64>,
}

impl Tree {
	/// Compute the class distribution for one instance. An instance missing the split attribute's value at a branch is sent to both children, and their distributions are blended by the branch proportions.
	pub fn predict(&self, instance: &[Value], n_classes: usize) -> Vec<f64> {
		let mut distribution = vec![0.0; n_classes];
		self.accumulate_distribution(0, instance, 1.0, &mut distribution);
		distribution
	}

	pub fn num_nodes(&self) -> usize {
		self.nodes.len()
	}

	fn accumulate_distribution(
		&self,
		node_index: usize,
		instance: &[Value],
		weight: f64,
		distribution: &mut [f64],
	) {
		match &self.nodes[node_index] {
			Node::Leaf(leaf) => {
				for (entry, probability) in
					distribution.iter_mut().zip(leaf.class_probabilities.iter())
				{
					*entry += weight * probability;
				}
			}
			Node::Branch(branch) => {
				let value = match &branch.split {
					BranchSplit::Number(split) => instance[split.attribute_index]
						.as_number()
						.map(|value| value as f64),
					BranchSplit::Enum(split) => instance[split.attribute_index]
						.as_enum()
						.map(|value| match value {
							Some(value) => (value.get() - 1) as f64,
							None => f64::NAN,
						}),
				};
				let value = value.unwrap();
				if value.is_nan() {
					// A missing value fans out a fractional vote instead of forcing a hard choice.
					self.accumulate_distribution(
						branch.left_child_index,
						instance,
						weight * branch.branch_proportions[0],
						distribution,
					);
					self.accumulate_distribution(
						branch.right_child_index,
						instance,
						weight * branch.branch_proportions[1],
						distribution,
					);
				} else {
					let child_index = if goes_left(&branch.split, value) {
						branch.left_child_index
					} else {
						branch.right_child_index
					};
					self.accumulate_distribution(child_index, instance, weight, distribution);
				}
			}
		}
	}

	/// The same walk, reading the instance's values out of the training cache. Used by the out-of-bag machinery.
	pub(crate) fn accumulate_distribution_for_cached_instance(
		&self,
		node_index: usize,
		cache: &TrainingCache,
		instance_index: usize,
		weight: f64,
		distribution: &mut [f64],
	) {
		match &self.nodes[node_index] {
			Node::Leaf(leaf) => {
				for (entry, probability) in
					distribution.iter_mut().zip(leaf.class_probabilities.iter())
				{
					*entry += weight * probability;
				}
			}
			Node::Branch(branch) => {
				let attribute_index = match &branch.split {
					BranchSplit::Number(split) => split.attribute_index,
					BranchSplit::Enum(split) => split.attribute_index,
				};
				let value = cache.value(attribute_index, instance_index) as f64;
				if value.is_nan() {
					self.accumulate_distribution_for_cached_instance(
						branch.left_child_index,
						cache,
						instance_index,
						weight * branch.branch_proportions[0],
						distribution,
					);
					self.accumulate_distribution_for_cached_instance(
						branch.right_child_index,
						cache,
						instance_index,
						weight * branch.branch_proportions[1],
						distribution,
					);
				} else {
					let child_index = if goes_left(&branch.split, value) {
						branch.left_child_index
					} else {
						branch.right_child_index
					};
					self.accumulate_distribution_for_cached_instance(
						child_index,
						cache,
						instance_index,
						weight,
						distribution,
					);
				}
			}
		}
	}
}

fn goes_left(split: &BranchSplit, value: f64) -> bool {
	match split {
		BranchSplit::Number(split) => value < split.split_value,
		BranchSplit::Enum(split) => value == split.option_index as f64,
	}
}

impl Forest {
	/// Compute the class probabilities for one instance by summing the distributions of every tree and normalizing, unless the sum is all zero.
	pub fn predict_probabilities(&self, instance: &[Value]) -> Vec<f64> {
		let mut distribution = vec![0.0; self.n_classes];
		for tree in self.trees.iter() {
			tree.accumulate_distribution(0, instance, 1.0, &mut distribution);
		}
		let total: f64 = distribution.iter().sum();
		if total > 0.0 {
			for entry in distribution.iter_mut() {
				*entry /= total;
			}
		}
		distribution
	}

	/// The class with the greatest probability, ties going to the lowest index.
	pub fn predict(&self, instance: &[Value]) -> usize {
		max_index(&self.predict_probabilities(instance))
	}
}

/// The index of the first greatest value.
pub(crate) fn max_index(values: &[f64]) -> usize {
	let mut max_index = 0;
	let mut max_value = f64::NEG_INFINITY;
	for (index, &value) in values.iter().enumerate() {
		if value > max_value {
			max_value = value;
			max_index = index;
		}
	}
	max_index
}
