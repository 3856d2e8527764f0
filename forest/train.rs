/*!
The training entry point. Configuration is validated up front, the cache is built once (including the global per-attribute sort), and then every bootstrap replica is drawn and seeded sequentially from the master generator before any work is submitted to the pool, so a fixed seed reproduces the same forest regardless of the thread count. Tree builds run as independent tasks on a fixed-size rayon pool behind a wait-for-all join barrier; the first task failure aborts the whole build and no partial forest is returned. Out-of-bag scoring and permutation importances run after the barrier, on the same pool.
*/

use crate::cache::TrainingCache;
use crate::feature_importances::compute_feature_importances;
use crate::oob::compute_out_of_bag_error;
use crate::train_tree::{train_tree, TrainTree};
use crate::{Forest, LeafNode, Node, TrainOptions, Tree};
use anyhow::{bail, Result};
use canopy_dataframe::{DataFrameView, EnumColumnView};
use canopy_progress::ProgressCounter;
use itertools::izip;
use num_traits::ToPrimitive;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;

/// This enum reports the training progress.
#[derive(Debug)]
pub enum Progress {
	Initializing(ProgressCounter),
	Training(ProgressCounter),
	ComputingOutOfBagError(ProgressCounter),
	ComputingFeatureImportances(ProgressCounter),
}

/// Train a forest on the given columns. `features` holds the predictor columns, `labels` the class column, and `weights` optional per-instance weights defaulting to one. Rows with a missing label are dropped before training.
pub fn train(
	features: DataFrameView,
	labels: EnumColumnView,
	weights: Option<&[f64]>,
	options: &TrainOptions,
	update_progress: &mut dyn FnMut(Progress),
) -> Result<Forest> {
	if options.n_trees == 0 {
		bail!("a forest needs at least one tree");
	}
	if options.attributes_per_split == Some(0) {
		bail!("attributes_per_split must be at least 1");
	}
	if options.bag_size_percent != 100
		&& (options.compute_out_of_bag_error || options.compute_feature_importances)
	{
		bail!("the bag size must be 100% if the out-of-bag error is to be computed");
	}

	let progress_counter = ProgressCounter::new(features.ncols().to_u64().unwrap());
	update_progress(Progress::Initializing(progress_counter.clone()));
	let mut cache = TrainingCache::from_dataframe(features, labels, weights, &progress_counter)?;

	let n_instances = cache.n_instances;
	let n_attributes = cache.n_attributes;
	let pool = rayon::ThreadPoolBuilder::new()
		.num_threads(options.n_threads.unwrap_or(0))
		.build()?;
	let mut rng = Xoshiro256Plus::seed_from_u64(options.seed);

	let (trees, in_bag) = if n_attributes == 0 {
		// A dataset with only a class distribution short-circuits to a trivial constant predictor. The instance set is fully out of bag for its single leaf tree, so the diagnostics below still apply.
		let tree = constant_tree(&cache)?;
		(vec![tree], vec![vec![false; n_instances]])
	} else {
		let n_attributes_per_split = match options.attributes_per_split {
			Some(k) => usize::min(k, n_attributes),
			None => {
				n_attributes
					.to_f64()
					.unwrap()
					.log2()
					.floor()
					.to_usize()
					.unwrap() + 1
			}
		};
		let bag_size = n_instances * options.bag_size_percent / 100;
		if bag_size == 0 {
			bail!(
				"a bag size of {}% of {} instances leaves nothing to train on",
				options.bag_size_percent,
				n_instances,
			);
		}
		// Draw the replicas and the per-tree seeds sequentially so that the forest does not depend on how the pool schedules the builds.
		let replicas: Vec<_> = (0..options.n_trees)
			.map(|_| {
				let sample = cache.resample(bag_size, &mut rng);
				let tree_rng = Xoshiro256Plus::seed_from_u64(rng.gen());
				(sample, tree_rng)
			})
			.collect();
		let progress_counter = ProgressCounter::new(options.n_trees.to_u64().unwrap());
		update_progress(Progress::Training(progress_counter.clone()));
		let results: Result<Vec<(TrainTree, Vec<bool>)>> = pool.install(|| {
			replicas
				.into_par_iter()
				.map(|(sample, tree_rng)| {
					let in_bag = sample.in_bag.clone();
					let tree = train_tree(
						sample,
						tree_rng,
						n_attributes_per_split,
						options.max_depth,
						options.min_instances_leaf,
					)?;
					progress_counter.inc(1);
					Ok((tree, in_bag))
				})
				.collect()
		});
		let (train_trees, in_bag): (Vec<TrainTree>, Vec<Vec<bool>>) =
			results?.into_iter().unzip();
		let trees = train_trees.into_iter().map(Into::into).collect();
		(trees, in_bag)
	};

	// The baseline out-of-bag error doubles as the reference point for the importances.
	let mut out_of_bag_error = None;
	if options.compute_out_of_bag_error || options.compute_feature_importances {
		let progress_counter = ProgressCounter::new(n_instances.to_u64().unwrap());
		update_progress(Progress::ComputingOutOfBagError(progress_counter.clone()));
		let error = pool.install(|| {
			compute_out_of_bag_error(&cache, &trees, &in_bag, &|| progress_counter.inc(1))
		})?;
		out_of_bag_error = Some(error);
	}

	let mut feature_importances = None;
	if options.compute_feature_importances {
		let progress_counter = ProgressCounter::new(n_attributes.to_u64().unwrap());
		update_progress(Progress::ComputingFeatureImportances(
			progress_counter.clone(),
		));
		let importances = pool.install(|| {
			compute_feature_importances(
				&mut cache,
				&trees,
				&in_bag,
				out_of_bag_error.unwrap(),
				&mut rng,
				&progress_counter,
			)
		})?;
		feature_importances = Some(importances);
	}

	Ok(Forest {
		trees,
		in_bag,
		classes: labels.options.to_vec(),
		n_classes: cache.n_classes,
		out_of_bag_error,
		feature_importances,
	})
}

/// The trivial predictor: a single leaf holding the prior class distribution, normalized by the total instance weight.
fn constant_tree(cache: &TrainingCache) -> Result<Tree> {
	let mut class_weights = vec![0.0; cache.n_classes];
	for (label, weight) in izip!(cache.labels().iter(), cache.weights().iter()) {
		match class_weights.get_mut(*label) {
			Some(entry) => *entry += weight,
			None => bail!(
				"class label {} out of range for {} classes",
				label,
				cache.n_classes,
			),
		}
	}
	let total: f64 = class_weights.iter().sum();
	if total > 0.0 {
		for entry in class_weights.iter_mut() {
			*entry /= total;
		}
	}
	Ok(Tree {
		nodes: vec![Node::Leaf(LeafNode {
			class_probabilities: class_weights,
		})],
	})
}
