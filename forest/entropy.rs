/*!
Split scoring for tree induction. The two entropy functions are unnormalized: they skip the division by the total weight and the conversion out of base 2, because only comparisons between candidate splits matter. They also use an approximate base-2 logarithm that is roughly four times faster than the standard library's, at the cost of a bounded error that is far below the differences being compared.
*/

/// Approximate `log2(x)` for positive, finite, normal `x`. The float is decomposed into its exponent and mantissa and the mantissa's logarithm is approximated by a small rational correction term.
pub fn fast_log2(x: f64) -> f64 {
	let bits = x.to_bits();
	// The mantissa bits reinterpreted with a fixed exponent, yielding a value in [0.5, 1).
	let mantissa = f64::from_bits((bits & 0x000f_ffff_ffff_ffff) | 0x3fe0_0000_0000_0000);
	let y = bits as f64 * (1.0 / (1u64 << 52) as f64);
	y - 1020.225_514_99 - 1.498_030_302 * mantissa - 1.725_879_99 / (0.352_088_706_8 + mantissa)
}

/// `x * log2(x)`, with `0 * log2(0)` defined as zero so that empty contingency cells contribute nothing.
pub fn xlogx(x: f64) -> f64 {
	if x <= 0.0 {
		0.0
	} else {
		x * fast_log2(x)
	}
}

/// The unnormalized entropy of the class distribution obtained by summing the two rows of the contingency table, before any split. Larger is worse.
pub fn entropy_over_columns(table: &[Vec<f64>; 2]) -> f64 {
	let mut result = 0.0;
	let mut total = 0.0;
	for (&below, &above) in table[0].iter().zip(table[1].iter()) {
		let column_total = below + above;
		result -= xlogx(column_total);
		total += column_total;
	}
	result + xlogx(total)
}

/// The unnormalized entropy of the class distribution conditioned on the two rows of the contingency table, after a split. Larger is worse.
pub fn entropy_conditioned_on_rows(table: &[Vec<f64>; 2]) -> f64 {
	let mut result = 0.0;
	for row in table.iter() {
		let mut row_total = 0.0;
		for &cell in row.iter() {
			result += xlogx(cell);
			row_total += cell;
		}
		result -= xlogx(row_total);
	}
	-result
}

/// Equality within the floating tolerance used for purity and zero checks.
pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
	(a - b).abs() < 1e-6
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_fast_log2_accuracy() {
		let values: [f64; 13] = [
			1e-6, 0.001, 0.1, 0.5, 1.0, 1.5, 2.0, 3.0, 10.0, 42.0, 1000.0, 123456.789, 1e9,
		];
		for &value in values.iter() {
			let exact = value.log2();
			let approximate = fast_log2(value);
			assert!(
				(exact - approximate).abs() < 1e-3,
				"log2({}) = {} but fast_log2 returned {}",
				value,
				exact,
				approximate,
			);
		}
	}

	#[test]
	fn test_xlogx_at_zero() {
		assert_eq!(xlogx(0.0), 0.0);
		assert_eq!(xlogx(-1.0), 0.0);
	}

	#[test]
	fn test_entropy_of_pure_rows_is_zero() {
		// Each row holds a single class, so no uncertainty remains after the split.
		let table = [vec![4.0, 0.0], vec![0.0, 6.0]];
		assert!(entropy_conditioned_on_rows(&table).abs() < 1e-3);
	}

	#[test]
	fn test_informative_split_reduces_entropy() {
		let mixed = [vec![3.0, 3.0], vec![3.0, 3.0]];
		let separated = [vec![6.0, 0.0], vec![0.0, 6.0]];
		let prior = entropy_over_columns(&mixed);
		assert!(entropy_conditioned_on_rows(&separated) < entropy_conditioned_on_rows(&mixed));
		assert!(entropy_conditioned_on_rows(&mixed) <= prior + 1e-3);
	}

	#[test]
	fn test_entropy_is_weight_scaled() {
		// The unnormalized measure scales with total weight, so halving all cells halves it.
		let table = [vec![2.0, 6.0], vec![4.0, 4.0]];
		let halved = [vec![1.0, 3.0], vec![2.0, 2.0]];
		let full = entropy_conditioned_on_rows(&table);
		let half = entropy_conditioned_on_rows(&halved);
		assert!((full - 2.0 * half).abs() < 1e-2);
	}
}
