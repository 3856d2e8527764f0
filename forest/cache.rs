/*!
The training cache is a columnar store of feature values, class labels, and instance weights, together with one index array per attribute holding the instance ids sorted ascending by that attribute's value, with missing values pushed to a contiguous suffix. The sort is performed once for the full dataset. Bootstrap replicas share the cache by reference and derive their own sorted index arrays by filtering the master ordering down to the sampled instances, so building a replica costs O(n_attributes * n_instances) instead of a fresh sort.
*/

use anyhow::{bail, Result};
use canopy_dataframe::{ColumnView, DataFrameView, EnumColumnView};
use canopy_progress::ProgressCounter;
use ndarray::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
	Number,
	Enum { n_options: usize },
}

pub struct TrainingCache {
	pub n_instances: usize,
	pub n_attributes: usize,
	pub n_classes: usize,
	/// The feature matrix, one row per attribute, so that a per-attribute scan touches contiguous memory. `NAN` marks a missing value. Enum values are stored as their zero-based option index.
	values: Array2<f32>,
	attributes: Vec<Attribute>,
	labels: Vec<usize>,
	weights: Vec<f64>,
	/// For each attribute, the instance ids sorted ascending by that attribute's value, missing values last.
	sorted_indices: Vec<Vec<u32>>,
}

/// A bootstrap replica of the cache. The replica shares the parent's value matrix and labels by reference, but owns its in-bag flags, its accumulated weights, and its own sorted index arrays restricted to the sampled instances. An instance drawn more than once carries a proportionally larger weight rather than appearing twice in the index arrays.
pub struct BootstrapSample<'a> {
	pub cache: &'a TrainingCache,
	pub weights: Vec<f64>,
	pub in_bag: Vec<bool>,
	pub n_in_bag: usize,
	pub sorted_indices: Vec<Vec<u32>>,
}

impl TrainingCache {
	/// Build the cache from the caller's columns. Rows whose label is missing are dropped. Feature enum values are validated against their column's options here; labels are validated when trees accumulate class weights.
	pub fn from_dataframe(
		features: DataFrameView,
		labels: EnumColumnView,
		weights: Option<&[f64]>,
		progress: &ProgressCounter,
	) -> Result<TrainingCache> {
		let n_rows = labels.data.len();
		let n_classes = labels.options.len();
		if n_classes == 0 {
			bail!("the label column must declare at least one class");
		}
		for column in features.columns.iter() {
			if column.len() != n_rows {
				bail!(
					"column {:?} has {} rows but the label column has {}",
					column.name(),
					column.len(),
					n_rows,
				);
			}
		}
		if let Some(weights) = weights {
			if weights.len() != n_rows {
				bail!(
					"{} weights were provided for {} rows",
					weights.len(),
					n_rows,
				);
			}
			if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
				bail!("instance weights must be finite and non-negative");
			}
		}
		// Drop the rows with a missing label.
		let kept_rows: Vec<usize> = (0..n_rows)
			.filter(|row| labels.data[*row].is_some())
			.collect();
		if kept_rows.is_empty() {
			bail!("no rows with a class label remain");
		}
		let n_instances = kept_rows.len();
		let n_attributes = features.ncols();
		let mut kept_weights = Vec::with_capacity(n_instances);
		for &row in kept_rows.iter() {
			kept_weights.push(weights.map(|weights| weights[row]).unwrap_or(1.0));
		}
		if kept_weights.iter().sum::<f64>() <= 0.0 {
			bail!("the total instance weight must be positive");
		}
		let kept_labels: Vec<usize> = kept_rows
			.iter()
			.map(|&row| labels.data[row].unwrap().get() - 1)
			.collect();
		let mut values = Array2::zeros((n_attributes, n_instances));
		let mut attributes = Vec::with_capacity(n_attributes);
		for (attribute_index, column) in features.columns.iter().enumerate() {
			let mut row = values.row_mut(attribute_index);
			match column.view() {
				ColumnView::Number(column) => {
					attributes.push(Attribute::Number);
					for (entry, &kept_row) in row.iter_mut().zip(kept_rows.iter()) {
						*entry = column.data[kept_row];
					}
				}
				ColumnView::Enum(column) => {
					let n_options = column.options.len();
					attributes.push(Attribute::Enum { n_options });
					for (entry, &kept_row) in row.iter_mut().zip(kept_rows.iter()) {
						*entry = match column.data[kept_row] {
							Some(value) => {
								let value = value.get() - 1;
								if value >= n_options {
									bail!(
										"column {:?} has a value {} outside its {} options",
										column.name,
										value,
										n_options,
									);
								}
								value as f32
							}
							None => f32::NAN,
						};
					}
				}
			}
		}
		let mut sorted_indices = Vec::with_capacity(n_attributes);
		for attribute_index in 0..n_attributes {
			let row = values.row(attribute_index);
			let mut indices: Vec<u32> = (0..n_instances as u32).collect();
			indices.sort_by(|&a, &b| compare_values(row[a as usize], row[b as usize]));
			sorted_indices.push(indices);
			progress.inc(1);
		}
		Ok(TrainingCache {
			n_instances,
			n_attributes,
			n_classes,
			values,
			attributes,
			labels: kept_labels,
			weights: kept_weights,
			sorted_indices,
		})
	}

	pub fn attribute(&self, attribute_index: usize) -> &Attribute {
		&self.attributes[attribute_index]
	}

	pub fn value(&self, attribute_index: usize, instance_index: usize) -> f32 {
		self.values[[attribute_index, instance_index]]
	}

	pub fn is_missing(&self, attribute_index: usize, instance_index: usize) -> bool {
		self.value(attribute_index, instance_index).is_nan()
	}

	pub fn label(&self, instance_index: usize) -> usize {
		self.labels[instance_index]
	}

	pub fn labels(&self) -> &[usize] {
		&self.labels
	}

	pub fn weight(&self, instance_index: usize) -> f64 {
		self.weights[instance_index]
	}

	pub fn weights(&self) -> &[f64] {
		&self.weights
	}

	pub fn sorted_indices(&self, attribute_index: usize) -> &[u32] {
		&self.sorted_indices[attribute_index]
	}

	/// Draw a bootstrap replica of `size` instances with replacement. The parent cache is never mutated.
	pub fn resample(&self, size: usize, rng: &mut impl Rng) -> BootstrapSample {
		let mut weights = vec![0.0; self.n_instances];
		let mut in_bag = vec![false; self.n_instances];
		let mut n_in_bag = 0;
		for _ in 0..size {
			let instance_index = rng.gen_range(0, self.n_instances);
			weights[instance_index] += self.weights[instance_index];
			if !in_bag[instance_index] {
				in_bag[instance_index] = true;
				n_in_bag += 1;
			}
		}
		// Filtering the master ordering keeps each replica array sorted, with the missing suffix intact.
		let sorted_indices = self
			.sorted_indices
			.iter()
			.map(|indices| {
				indices
					.iter()
					.filter(|&&instance_index| in_bag[instance_index as usize])
					.copied()
					.collect()
			})
			.collect();
		BootstrapSample {
			cache: self,
			weights,
			in_bag,
			n_in_bag,
			sorted_indices,
		}
	}

	/// Randomly permute one attribute's values across all instances and return the previous column so the caller can restore it. Used only for permutation importance with an already trained forest: the sorted index arrays are left untouched, so the cache must not train new trees until the column is restored.
	pub fn scramble_attribute(&mut self, attribute_index: usize, rng: &mut impl Rng) -> Vec<f32> {
		let mut row = self.values.row_mut(attribute_index);
		let row = row.as_slice_mut().unwrap();
		let original = row.to_vec();
		row.shuffle(rng);
		original
	}

	/// Put back the column returned by `scramble_attribute`.
	pub fn restore_attribute(&mut self, attribute_index: usize, original: Vec<f32>) {
		let mut row = self.values.row_mut(attribute_index);
		row.as_slice_mut().unwrap().copy_from_slice(&original);
	}
}

/// Ascending order with missing values sorted after every present value.
fn compare_values(a: f32, b: f32) -> Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Greater,
		(false, true) => Ordering::Less,
		(false, false) => a.partial_cmp(&b).unwrap(),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use canopy_dataframe::{Column, EnumColumn, NumberColumn};
	use rand::SeedableRng;
	use rand_xoshiro::Xoshiro256Plus;
	use std::num::NonZeroUsize;

	fn test_cache() -> TrainingCache {
		let columns = vec![
			Column::Number(NumberColumn {
				name: "a".to_owned(),
				data: vec![3.0, f32::NAN, 1.0, 2.0, f32::NAN, 0.5],
			}),
			Column::Enum(EnumColumn {
				name: "b".to_owned(),
				options: vec!["x".to_owned(), "y".to_owned(), "z".to_owned()],
				data: vec![
					NonZeroUsize::new(2),
					NonZeroUsize::new(1),
					NonZeroUsize::new(3),
					None,
					NonZeroUsize::new(1),
					NonZeroUsize::new(2),
				],
			}),
		];
		let label_options = vec!["no".to_owned(), "yes".to_owned()];
		let label_data = vec![
			NonZeroUsize::new(1),
			NonZeroUsize::new(2),
			NonZeroUsize::new(1),
			NonZeroUsize::new(2),
			NonZeroUsize::new(1),
			NonZeroUsize::new(2),
		];
		TrainingCache::from_dataframe(
			DataFrameView { columns: &columns },
			EnumColumnView {
				name: "label",
				options: &label_options,
				data: &label_data,
			},
			None,
			&ProgressCounter::new(2),
		)
		.unwrap()
	}

	#[test]
	fn test_sorted_indices_with_missing_suffix() {
		let cache = test_cache();
		assert_eq!(cache.sorted_indices(0), &[5, 2, 3, 0, 1, 4]);
		// Instances 1 and 4 are missing attribute 0 and occupy the suffix.
		assert!(cache.is_missing(0, 1));
		assert!(cache.is_missing(0, 4));
		// The enum attribute sorts by option index with the missing instance last.
		let sorted = cache.sorted_indices(1);
		assert_eq!(sorted[5], 3);
		assert!(cache.is_missing(1, 3));
	}

	#[test]
	fn test_rows_with_missing_labels_are_dropped() {
		let columns = vec![Column::Number(NumberColumn {
			name: "a".to_owned(),
			data: vec![1.0, 2.0, 3.0],
		})];
		let label_options = vec!["no".to_owned(), "yes".to_owned()];
		let label_data = vec![NonZeroUsize::new(1), None, NonZeroUsize::new(2)];
		let cache = TrainingCache::from_dataframe(
			DataFrameView { columns: &columns },
			EnumColumnView {
				name: "label",
				options: &label_options,
				data: &label_data,
			},
			None,
			&ProgressCounter::new(1),
		)
		.unwrap();
		assert_eq!(cache.n_instances, 2);
		assert_eq!(cache.labels(), &[0, 1]);
		assert_eq!(cache.value(0, 1), 3.0);
	}

	#[test]
	fn test_resample_never_mutates_the_parent() {
		let cache = test_cache();
		let sorted_before: Vec<Vec<u32>> =
			(0..2).map(|a| cache.sorted_indices(a).to_vec()).collect();
		let weights_before = cache.weights().to_vec();
		let mut rng = Xoshiro256Plus::seed_from_u64(7);
		let sample = cache.resample(cache.n_instances, &mut rng);
		assert_eq!(sorted_before[0], cache.sorted_indices(0));
		assert_eq!(sorted_before[1], cache.sorted_indices(1));
		assert_eq!(weights_before, cache.weights());
		// The replica weight total equals the number of draws, since every weight is 1.
		let total: f64 = sample.weights.iter().sum();
		assert!((total - cache.n_instances as f64).abs() < 1e-12);
		// In-bag flags agree with the accumulated weights.
		for (weight, in_bag) in sample.weights.iter().zip(sample.in_bag.iter()) {
			assert_eq!(*weight > 0.0, *in_bag);
		}
		assert_eq!(sample.in_bag.iter().filter(|&&b| b).count(), sample.n_in_bag);
	}

	#[test]
	fn test_resample_preserves_sort_order() {
		let cache = test_cache();
		let mut rng = Xoshiro256Plus::seed_from_u64(3);
		let sample = cache.resample(cache.n_instances, &mut rng);
		for attribute_index in 0..cache.n_attributes {
			let indices = &sample.sorted_indices[attribute_index];
			assert_eq!(indices.len(), sample.n_in_bag);
			for pair in indices.windows(2) {
				let a = cache.value(attribute_index, pair[0] as usize);
				let b = cache.value(attribute_index, pair[1] as usize);
				assert!(compare_values(a, b) != Ordering::Greater);
			}
		}
	}

	#[test]
	fn test_scramble_and_restore() {
		let mut cache = test_cache();
		let before: Vec<f32> = (0..cache.n_instances).map(|i| cache.value(0, i)).collect();
		let mut rng = Xoshiro256Plus::seed_from_u64(11);
		let original = cache.scramble_attribute(0, &mut rng);
		assert_eq!(original, before);
		// The scrambled column is a permutation of the original.
		let mut scrambled: Vec<f32> = (0..cache.n_instances).map(|i| cache.value(0, i)).collect();
		let mut expected = before.clone();
		scrambled.sort_by(|a, b| compare_values(*a, *b));
		expected.sort_by(|a, b| compare_values(*a, *b));
		for (a, b) in scrambled.iter().zip(expected.iter()) {
			assert!(a == b || (a.is_nan() && b.is_nan()));
		}
		cache.restore_attribute(0, original);
		for (i, value) in before.iter().enumerate() {
			let restored = cache.value(0, i);
			assert!(restored == *value || (restored.is_nan() && value.is_nan()));
		}
	}

	#[test]
	fn test_mismatched_weights_are_rejected() {
		let columns = vec![Column::Number(NumberColumn {
			name: "a".to_owned(),
			data: vec![1.0, 2.0],
		})];
		let label_options = vec!["no".to_owned()];
		let label_data = vec![NonZeroUsize::new(1), NonZeroUsize::new(1)];
		let result = TrainingCache::from_dataframe(
			DataFrameView { columns: &columns },
			EnumColumnView {
				name: "label",
				options: &label_options,
				data: &label_data,
			},
			Some(&[1.0]),
			&ProgressCounter::new(1),
		);
		assert!(result.is_err());
	}
}
