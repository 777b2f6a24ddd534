use std::collections::BTreeMap;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use hs_types::{DataError, HsError, HsResult};
use rand::seq::SliceRandom;
use rand::Rng;

/// Column used by [`train_test_split`] and [`train_test_val_split`].
pub const LABEL_COLUMN: &str = "label";

/// Split row indices into (train, test), stratified by `labels`.
///
/// Labels seen only once cannot be stratified and always go to train, after
/// the stratified train rows. The remaining rows contribute `ceil(frac * n)`
/// test rows, allocated to labels in proportion to their counts (largest
/// remainder first). Both partitions keep input order.
pub fn stratified_indices<R: Rng + ?Sized>(
    labels: &[String],
    frac: f64,
    rng: &mut R,
) -> HsResult<(Vec<usize>, Vec<usize>)> {
    if !(0.0..=1.0).contains(&frac) {
        return Err(DataError::InvalidFraction { value: frac }.into());
    }

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        groups.entry(label.as_str()).or_default().push(i);
    }

    let mut singles = Vec::new();
    let mut splittable: Vec<Vec<usize>> = Vec::new();
    for (_, rows) in groups {
        if rows.len() > 1 {
            splittable.push(rows);
        } else {
            singles.extend(rows);
        }
    }
    singles.sort_unstable();

    let n: usize = splittable.iter().map(Vec::len).sum();
    let n_test = ((frac * n as f64).ceil() as usize).min(n);

    // floor of each label's share, then hand out the remainder
    let shares: Vec<f64> = splittable
        .iter()
        .map(|rows| rows.len() as f64 * n_test as f64 / n.max(1) as f64)
        .collect();
    let mut quotas: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();
    let mut remaining = n_test - quotas.iter().sum::<usize>();
    let mut order: Vec<usize> = (0..splittable.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = shares[a] - shares[a].floor();
        let fb = shares[b] - shares[b].floor();
        fb.total_cmp(&fa)
            .then(splittable[b].len().cmp(&splittable[a].len()))
    });
    for &g in order.iter().cycle().take(order.len() * 2) {
        if remaining == 0 {
            break;
        }
        if quotas[g] < splittable[g].len() {
            quotas[g] += 1;
            remaining -= 1;
        }
    }

    let mut train = Vec::with_capacity(labels.len() - n_test);
    let mut test = Vec::with_capacity(n_test);
    for (mut rows, quota) in splittable.into_iter().zip(quotas) {
        rows.shuffle(rng);
        test.extend_from_slice(&rows[..quota]);
        train.extend_from_slice(&rows[quota..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    train.extend(singles);

    tracing::debug!(
        "Stratified split: {} train rows, {} test rows",
        train.len(),
        test.len()
    );
    Ok((train, test))
}

fn column_labels(batch: &RecordBatch, column: &str) -> HsResult<Vec<String>> {
    let idx = batch
        .schema()
        .index_of(column)
        .map_err(|_| DataError::ColumnNotFound {
            column: column.to_string(),
        })?;
    let array = batch.column(idx);
    (0..batch.num_rows())
        .map(|i| {
            array_value_to_string(array, i).map_err(|e| {
                HsError::from(DataError::Arrow {
                    message: e.to_string(),
                })
            })
        })
        .collect()
}

fn take_rows(batch: &RecordBatch, rows: &[usize]) -> HsResult<RecordBatch> {
    let indices = UInt32Array::from_iter_values(rows.iter().map(|&i| i as u32));
    take_record_batch(batch, &indices).map_err(|e| {
        HsError::from(DataError::Arrow {
            message: e.to_string(),
        })
    })
}

/// Split a record batch into (train, test), stratified on `column`.
pub fn stratified_split<R: Rng + ?Sized>(
    batch: &RecordBatch,
    frac: f64,
    column: &str,
    rng: &mut R,
) -> HsResult<(RecordBatch, RecordBatch)> {
    let labels = column_labels(batch, column)?;
    let (train, test) = stratified_indices(&labels, frac, rng)?;
    Ok((take_rows(batch, &train)?, take_rows(batch, &test)?))
}

/// Stratified (train, test) split on the `label` column. `fraction` is capped at 1.
pub fn train_test_split<R: Rng + ?Sized>(
    batch: &RecordBatch,
    fraction: f64,
    rng: &mut R,
) -> HsResult<(RecordBatch, RecordBatch)> {
    stratified_split(batch, fraction.min(1.0), LABEL_COLUMN, rng)
}

/// Stratified (train, test, validation) split on the `label` column.
///
/// `fraction` of the rows is held out and then halved into test and
/// validation.
pub fn train_test_val_split<R: Rng + ?Sized>(
    batch: &RecordBatch,
    fraction: f64,
    rng: &mut R,
) -> HsResult<(RecordBatch, RecordBatch, RecordBatch)> {
    let (train, held_out) = stratified_split(batch, fraction.min(1.0), LABEL_COLUMN, rng)?;
    let (test, val) = stratified_split(&held_out, 0.5, LABEL_COLUMN, rng)?;
    Ok((train, test, val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn labels(spec: &[(&str, usize)]) -> Vec<String> {
        spec.iter()
            .flat_map(|(label, n)| std::iter::repeat(label.to_string()).take(*n))
            .collect()
    }

    fn batch(labels: &[String]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new(LABEL_COLUMN, DataType::Utf8, false),
        ]));
        let ids: ArrayRef = Arc::new(Int32Array::from_iter_values(0..labels.len() as i32));
        let labels: ArrayRef = Arc::new(StringArray::from_iter_values(labels.iter()));
        RecordBatch::try_new(schema, vec![ids, labels]).unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<i32> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    #[test]
    fn every_row_lands_exactly_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let labels = labels(&[("a", 10), ("b", 7), ("c", 3), ("d", 2)]);
        for frac in [0.0, 0.1, 0.2, 0.5, 0.9, 1.0] {
            let (train, test) = stratified_indices(&labels, frac, &mut rng).unwrap();
            let mut all: Vec<usize> = train.iter().chain(test.iter()).copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..labels.len()).collect::<Vec<_>>(), "frac {frac}");
            assert_eq!(test.len(), (frac * labels.len() as f64).ceil() as usize);
        }
    }

    #[test]
    fn singleton_labels_go_to_train() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let labels = labels(&[("a", 6), ("lonely", 1), ("b", 4), ("solo", 1)]);
        let (train, test) = stratified_indices(&labels, 0.5, &mut rng).unwrap();
        for (i, label) in labels.iter().enumerate() {
            if label == "lonely" || label == "solo" {
                assert!(train.contains(&i));
                assert!(!test.contains(&i));
            }
        }
        assert_eq!(train.len() + test.len(), labels.len());
        assert_eq!(test.len(), 5);
    }

    #[test]
    fn split_is_proportional_per_label() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let labels = labels(&[("a", 50), ("b", 30), ("c", 20)]);
        let (_, test) = stratified_indices(&labels, 0.2, &mut rng).unwrap();
        let count = |l: &str| test.iter().filter(|&&i| labels[i] == l).count();
        assert_eq!((count("a"), count("b"), count("c")), (10, 6, 4));
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let labels = labels(&[("a", 4)]);
        assert!(stratified_indices(&labels, -0.1, &mut rng).is_err());
        assert!(stratified_indices(&labels, f64::NAN, &mut rng).is_err());
    }

    #[test]
    fn record_batch_split() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let data = batch(&labels(&[("cat", 8), ("dog", 8), ("bird", 1)]));
        let (train, test) = train_test_split(&data, 0.25, &mut rng).unwrap();
        assert_eq!(train.num_rows() + test.num_rows(), 17);
        assert_eq!(test.num_rows(), 4);

        let mut seen: HashSet<i32> = ids(&train).into_iter().collect();
        for id in ids(&test) {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 17);
        // the single bird row is the last row of train
        assert_eq!(ids(&train).last(), Some(&16));
    }

    #[test]
    fn train_test_val_split_covers_all_rows() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let data = batch(&labels(&[("x", 20), ("y", 20)]));
        let (train, test, val) = train_test_val_split(&data, 0.2, &mut rng).unwrap();
        assert_eq!(train.num_rows(), 32);
        assert_eq!(test.num_rows() + val.num_rows(), 8);
        assert_eq!(val.num_rows(), 4);
    }

    #[test]
    fn missing_column_is_an_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let data = batch(&labels(&[("x", 4)]));
        assert!(stratified_split(&data, 0.5, "target", &mut rng).is_err());
    }
}
