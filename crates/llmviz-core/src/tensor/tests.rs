use super::*;

fn arange(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}

fn inverse_permutation(axes: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; axes.len()];
    for (i, &a) in axes.iter().enumerate() {
        inv[a] = i;
    }
    inv
}

/// All permutations of `0..n` (Heap's algorithm).
fn all_permutations(n: usize) -> Vec<Vec<usize>> {
    fn heap(k: usize, items: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        heap(k - 1, items, out);
        for i in 0..k - 1 {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            heap(k - 1, items, out);
        }
    }
    let mut items: Vec<usize> = (0..n).collect();
    let mut out = Vec::new();
    heap(n, &mut items, &mut out);
    out
}

#[test]
fn test_new_uses_canonical_strides() {
    let t = TensorView::new(vec![2, 3, 4], arange(24)).unwrap();
    assert_eq!(t.stride(), &[12, 4, 1]);
    assert!(t.is_contiguous());
    assert_eq!(t.num_elements(), 24);
}

#[test]
fn test_new_rejects_short_buffer() {
    let err = TensorView::new(vec![2, 3], arange(5)).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidShape { .. }));
}

#[test]
fn test_new_rejects_rank_zero() {
    let err = TensorView::new(vec![], arange(1)).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidShape { .. }));
}

#[test]
fn test_larger_buffer_is_allowed() {
    let t = TensorView::new(vec![2, 2], arange(10)).unwrap();
    assert_eq!(t.to_dense_vec(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_explicit_stride_rank_mismatch() {
    let storage = Arc::new(RwLock::new(arange(6)));
    let err = TensorView::from_storage(vec![2, 3], storage, Some(vec![1])).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidShape { .. }));
}

#[test]
fn test_explicit_stride_past_buffer() {
    let storage = Arc::new(RwLock::new(arange(6)));
    let err = TensorView::from_storage(vec![2, 3], storage, Some(vec![4, 1])).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidShape { .. }));
}

#[test]
fn test_index_iterator_row_major() {
    let t = TensorView::new(vec![2, 3], arange(6)).unwrap();
    let indices: Vec<Vec<usize>> = t.index_iter().collect();
    assert_eq!(
        indices,
        vec![
            vec![0, 0],
            vec![0, 1],
            vec![0, 2],
            vec![1, 0],
            vec![1, 1],
            vec![1, 2],
        ]
    );
    let values: Vec<f32> = t.index_iter().map(|i| t.get(&i).unwrap()).collect();
    assert_eq!(values, arange(6));
}

#[test]
fn test_index_iterator_is_restartable() {
    let mut iter = IndexIter::new(&[2, 2]);
    let first: Vec<_> = iter.clone().collect();
    assert_eq!(iter.next(), Some(vec![0, 0]));
    assert_eq!(iter.next(), Some(vec![0, 1]));
    iter.reset();
    let again: Vec<_> = iter.collect();
    assert_eq!(first, again);
    assert_eq!(again.len(), 4);
}

#[test]
fn test_index_iterator_empty_dimension() {
    assert_eq!(IndexIter::new(&[3, 0, 2]).count(), 0);
}

#[test]
fn test_view_shares_storage() {
    let t = TensorView::new(vec![2, 6], arange(12)).unwrap();
    let v = t.view(&[3, 4]).unwrap();
    assert!(v.shares_storage_with(&t));
    v.set(&[2, 3], 100.0).unwrap();
    assert_eq!(t.get(&[1, 5]).unwrap(), 100.0);
}

#[test]
fn test_view_succeeds_iff_contiguous_and_sizes_match() {
    let t = TensorView::new(vec![2, 3, 4], arange(24)).unwrap();

    assert!(t.view(&[6, 4]).is_ok());
    assert!(t.view(&[24]).is_ok());
    assert!(matches!(
        t.view(&[5, 5]).unwrap_err(),
        PipelineError::Reshape { .. }
    ));

    let p = t.permute(&[2, 0, 1]).unwrap();
    assert!(!p.is_contiguous());
    assert!(matches!(
        p.view(&[24]).unwrap_err(),
        PipelineError::Reshape { .. }
    ));

    // A materialized copy is contiguous again.
    assert!(p.contiguous().unwrap().view(&[4, 6]).is_ok());
}

#[test]
fn test_transpose_swaps_shape_and_stride() {
    let t = TensorView::new(vec![2, 3], arange(6)).unwrap();
    let tt = t.transpose(0, 1).unwrap();
    assert_eq!(tt.shape(), &[3, 2]);
    assert_eq!(tt.stride(), &[1, 3]);
    assert!(tt.shares_storage_with(&t));
    assert_eq!(tt.to_dense_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn test_transpose_rejects_bad_axes() {
    let t = TensorView::new(vec![2, 3], arange(6)).unwrap();
    assert!(matches!(
        t.transpose(1, 1).unwrap_err(),
        PipelineError::Index { .. }
    ));
    assert!(matches!(
        t.transpose(0, 2).unwrap_err(),
        PipelineError::Index { .. }
    ));
}

#[test]
fn test_permute_rejects_non_permutations() {
    let t = TensorView::new(vec![2, 3, 4], arange(24)).unwrap();
    for axes in [vec![0, 1], vec![0, 1, 1], vec![0, 1, 3], vec![0, 1, 2, 3]] {
        assert!(
            matches!(t.permute(&axes).unwrap_err(), PipelineError::Index { .. }),
            "axes {axes:?} should be rejected"
        );
    }
}

#[test]
fn test_permute_round_trip_all_permutations() {
    let shape = vec![2, 3, 4, 5];
    let t = TensorView::new(shape.clone(), arange(120)).unwrap();
    let original = t.to_dense_vec();

    for axes in all_permutations(shape.len()) {
        let p = t.permute(&axes).unwrap();
        let back = p.permute(&inverse_permutation(&axes)).unwrap();
        assert_eq!(back.shape(), shape.as_slice(), "axes {axes:?}");
        assert_eq!(back.to_dense_vec(), original, "axes {axes:?}");
        assert!(back.is_contiguous());
    }
}

#[test]
fn test_dense_walk_matches_get() {
    let t = TensorView::new(vec![3, 2, 4], arange(24)).unwrap();
    let p = t.permute(&[1, 2, 0]).unwrap();
    let dense = p.to_dense_vec();
    let walked: Vec<f32> = p.index_iter().map(|i| p.get(&i).unwrap()).collect();
    assert_eq!(dense, walked);
    assert_eq!(p.shape(), &[2, 4, 3]);
    // p[i, j, k] == t[k, i, j]
    assert_eq!(p.get(&[1, 3, 2]).unwrap(), t.get(&[2, 1, 3]).unwrap());
}

#[test]
fn test_qkv_weight_staging_layout() {
    // [3C, C] -> [3, H, A, C] -> [H, A, C, 3]: channel k of cell (c, h*A+a) is
    // row k*C + h*A + a, column c of the original matrix.
    let (h, a, c) = (2, 3, 6);
    let w = TensorView::new(vec![3 * c, c], arange(3 * c * c)).unwrap();
    let staged = w
        .view(&[3, h, a, c])
        .unwrap()
        .permute(&[1, 2, 3, 0])
        .unwrap()
        .to_dense_vec();

    for hi in 0..h {
        for ai in 0..a {
            for ci in 0..c {
                for k in 0..3 {
                    let dense_idx = ((hi * a + ai) * c + ci) * 3 + k;
                    let row = k * c + hi * a + ai;
                    assert_eq!(staged[dense_idx], w.get(&[row, ci]).unwrap());
                }
            }
        }
    }
}

#[test]
fn test_get_out_of_bounds() {
    let t = TensorView::new(vec![2, 3], arange(6)).unwrap();
    assert!(matches!(
        t.get(&[2, 0]).unwrap_err(),
        PipelineError::Bounds { .. }
    ));
    assert!(matches!(
        t.get(&[0]).unwrap_err(),
        PipelineError::Bounds { .. }
    ));
    assert!(matches!(
        t.set(&[0, 3], 1.0).unwrap_err(),
        PipelineError::Bounds { .. }
    ));
}

#[test]
fn test_copy_from() {
    let a = TensorView::zeros(vec![2, 2]).unwrap();
    let b = TensorView::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    a.copy_from(&b).unwrap();
    assert_eq!(a.to_dense_vec(), vec![1.0, 2.0, 3.0, 4.0]);

    let c = TensorView::zeros(vec![4]).unwrap();
    assert!(c.copy_from(&b).is_err());
    let bt = b.transpose(0, 1).unwrap();
    assert!(a.copy_from(&bt).is_err());
}

#[test]
fn test_to_ndarray_follows_view_order() {
    let t = TensorView::new(vec![2, 3], arange(6)).unwrap();
    let arr = t.transpose(0, 1).unwrap().to_ndarray().unwrap();
    assert_eq!(arr.shape(), &[3, 2]);
    assert_eq!(arr[[2, 1]], 5.0);
    assert_eq!(arr[[1, 0]], 1.0);
}
