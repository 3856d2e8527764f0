/*!
Permutation feature importance. With the forest already trained, one attribute at a time has its column scrambled in place, the out-of-bag error is recomputed with the fixed forest, and the attribute's importance is recorded as the increase over the baseline error before the column is restored. The attributes are strictly sequential because scrambling mutates the shared cache; taking the cache by `&mut` makes the exclusive phase explicit, so no vote task can be in flight while a column is scrambled. The inner out-of-bag pass is still parallel across instances.
*/

use crate::cache::TrainingCache;
use crate::oob::compute_out_of_bag_error;
use crate::Tree;
use anyhow::Result;
use canopy_progress::ProgressCounter;
use rand::Rng;

pub fn compute_feature_importances(
	cache: &mut TrainingCache,
	trees: &[Tree],
	in_bag: &[Vec<bool>],
	baseline_error: f64,
	rng: &mut impl Rng,
	progress: &ProgressCounter,
) -> Result<Vec<f64>> {
	let mut importances = vec![0.0; cache.n_attributes];
	for attribute_index in 0..cache.n_attributes {
		let original = cache.scramble_attribute(attribute_index, rng);
		let scrambled_error = compute_out_of_bag_error(cache, trees, in_bag, &|| {});
		// Restore before surfacing any error so the cache is never left scrambled.
		cache.restore_attribute(attribute_index, original);
		importances[attribute_index] = scrambled_error? - baseline_error;
		progress.inc(1);
	}
	Ok(importances)
}
