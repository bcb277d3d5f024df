// src/decoder/output.rs

use ringbuf::traits::Producer as RbProducer;
use std::time::Duration;

/// Push `data` into the ring buffer, blocking while it is full.
/// The first `post_seek_fade_samples` samples are ramped in.
///
/// Returns `false` if `abort` fired before everything was pushed; the
/// remainder is dropped.
pub fn push_with_fade<P, A>(
    producer: &mut P,
    data: &[f32],
    post_seek_fade_samples: &mut usize,
    abort: A,
) -> bool
where
    P: RbProducer<Item = f32>,
    A: Fn() -> bool,
{
    let fade_len = (*post_seek_fade_samples).min(data.len());
    let mut idx = 0usize;

    while idx < data.len() {
        let s = if idx < fade_len {
            data[idx] * (idx as f32 / fade_len as f32)
        } else {
            data[idx]
        };
        match producer.try_push(s) {
            Ok(()) => idx += 1,
            Err(_) => {
                if abort() {
                    *post_seek_fade_samples -= idx.min(fade_len);
                    return false;
                }
                std::thread::park_timeout(Duration::from_micros(200));
            }
        }
    }

    *post_seek_fade_samples -= fade_len;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::HeapRb;
    use ringbuf::traits::{Consumer, Split};

    #[test]
    fn ramps_in_after_seek() {
        let (mut prod, mut cons) = HeapRb::<f32>::new(16).split();
        let mut fade = 4usize;
        assert!(push_with_fade(&mut prod, &[1.0; 6], &mut fade, || false));
        assert_eq!(fade, 0);

        let out: Vec<f32> = std::iter::from_fn(|| cons.try_pop()).collect();
        assert_eq!(out, vec![0.0, 0.25, 0.5, 0.75, 1.0, 1.0]);
    }

    #[test]
    fn aborts_when_full() {
        let (mut prod, _cons) = HeapRb::<f32>::new(4).split();
        let mut fade = 0usize;
        assert!(!push_with_fade(&mut prod, &[0.5; 8], &mut fade, || true));
    }
}
