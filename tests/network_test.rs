use std::collections::HashMap;
use znn_rs::network::{
    ConvOptions, FilterInit, Network, NetworkBuilder, NetworkConfig, TransferFn, Volumes,
};
use znn_rs::tensor::{Cube, Real, Vec3i};
use znn_rs::ZnnError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn volumes(name: &str, cubes: Vec<Cube>) -> Volumes {
    HashMap::from([(name.to_string(), cubes)])
}

fn ramp(shape: Vec3i, seed: usize) -> Cube {
    let n = shape[0] * shape[1] * shape[2];
    let data = (0..n)
        .map(|i| ((i * 7 + seed * 3) % 11) as Real / 11.0 - 0.5)
        .collect();
    Cube::new(data, shape).unwrap()
}

fn assert_close(a: &Cube, b: &Cube, tol: Real) {
    assert_eq!(a.shape(), b.shape());
    for (i, (x, y)) in a.data().iter().zip(b.data()).enumerate() {
        assert!((x - y).abs() < tol, "element {i}: {x} vs {y}");
    }
}

#[test]
fn test_fft_all_ones_equals_direct_convolution() {
    init_tracing();
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2).with_fft(true))
        .input("input", 1, [9, 9, 1])
        .sum("output", 1)
        .conv(
            "conv",
            "input",
            "output",
            ConvOptions::new([3, 3, 1]).with_init(FilterInit::Constant(1.0)),
        )
        .build()
        .unwrap();

    assert_eq!(net.node_size("output").unwrap(), [7, 7, 1]);
    let out = net
        .forward(volumes("input", vec![Cube::ones([9, 9, 1])]))
        .unwrap();

    let direct = Cube::ones([9, 9, 1])
        .convolve_sparse(&Cube::ones([3, 3, 1]), [1, 1, 1])
        .unwrap();
    assert_eq!(out["output"][0].shape(), &[7, 7, 1]);
    assert_close(&out["output"][0], &direct, 1e-9);
    assert!(out["output"][0].data().iter().all(|v| (v - 9.0).abs() < 1e-9));
}

fn two_layer(fft: bool) -> Network {
    NetworkBuilder::new(NetworkConfig::default().with_threads(4).with_eta(0.05).with_fft(fft))
        .input("input", 2, [7, 7, 2])
        .transfer("hidden", 3, TransferFn::Tanh(1.0, 1.0))
        .sum("output", 1)
        .conv(
            "conv1",
            "input",
            "hidden",
            ConvOptions::new([3, 3, 1])
                .with_stride([1, 2, 1])
                .with_init(FilterInit::Uniform {
                    low: -0.5,
                    high: 0.5,
                    seed: 11,
                }),
        )
        .conv(
            "conv2",
            "hidden",
            "output",
            ConvOptions::new([2, 2, 2]).with_init(FilterInit::Uniform {
                low: -0.5,
                high: 0.5,
                seed: 5,
            }),
        )
        .build()
        .unwrap()
}

#[test]
fn test_fft_and_spatial_edges_agree() {
    init_tracing();
    let mut spatial = two_layer(false);
    let mut fft = two_layer(true);
    assert_eq!(spatial.node_size("output").unwrap(), [4, 2, 1]);

    let inputs = vec![ramp([7, 7, 2], 1), ramp([7, 7, 2], 2)];
    let a = spatial.forward(volumes("input", inputs.clone())).unwrap();
    let b = fft.forward(volumes("input", inputs.clone())).unwrap();
    assert_close(&a["output"][0], &b["output"][0], 1e-9);

    let ga = spatial
        .backward(volumes("output", a["output"].clone()))
        .unwrap();
    let gb = fft.backward(volumes("output", b["output"].clone())).unwrap();
    for (x, y) in ga["input"].iter().zip(&gb["input"]) {
        assert_close(x, y, 1e-9);
    }

    for group in ["conv1", "conv2"] {
        let wa = spatial.filters(group).unwrap();
        let wb = fft.filters(group).unwrap();
        assert_eq!(wa.len(), wb.len());
        for (x, y) in wa.iter().zip(&wb) {
            assert_close(x, y, 1e-9);
        }
    }

    // the second pass runs on the updated filters
    let a = spatial.forward(volumes("input", inputs.clone())).unwrap();
    let b = fft.forward(volumes("input", inputs)).unwrap();
    assert_close(&a["output"][0], &b["output"][0], 1e-9);
}

// Network: input -> conv -> tanh. Loss is half the sum of squared outputs.
fn check_gradients(fft: bool) {
    let stride = [2, 1, 1];
    let x = ramp([6, 5, 3], 4);
    let config = NetworkConfig::default()
        .with_threads(3)
        .with_eta(1.0)
        .with_fft(fft);
    let mut net = NetworkBuilder::new(config)
        .input("input", 1, [6, 5, 3])
        .transfer("output", 1, TransferFn::Tanh(1.0, 1.0))
        .conv(
            "conv",
            "input",
            "output",
            ConvOptions::new([2, 2, 2])
                .with_stride(stride)
                .with_init(FilterInit::Uniform {
                    low: -0.5,
                    high: 0.5,
                    seed: 3,
                }),
        )
        .build()
        .unwrap();

    let w0 = net.filters("conv").unwrap().remove(0);
    let loss = |x: &Cube, w: &Cube| -> Real {
        let y = x.convolve_sparse(w, stride).unwrap().map(|v| v.tanh());
        0.5 * y.data().iter().map(|v| v * v).sum::<Real>()
    };

    let out = net.forward(volumes("input", vec![x.clone()])).unwrap();
    let grads = net.backward(volumes("output", out["output"].clone())).unwrap();
    let w1 = net.filters("conv").unwrap().remove(0);

    let h = 1e-5;
    for k in 0..w0.size() {
        let mut plus = w0.clone();
        plus.data_mut()[k] += h;
        let mut minus = w0.clone();
        minus.data_mut()[k] -= h;
        let numeric = (loss(&x, &plus) - loss(&x, &minus)) / (2.0 * h);
        let applied = w0.data()[k] - w1.data()[k];
        assert!(
            (numeric - applied).abs() < 1e-6,
            "weight {k}: numeric {numeric}, applied {applied}"
        );
    }

    let dx = &grads["input"][0];
    for i in 0..x.size() {
        let mut plus = x.clone();
        plus.data_mut()[i] += h;
        let mut minus = x.clone();
        minus.data_mut()[i] -= h;
        let numeric = (loss(&plus, &w0) - loss(&minus, &w0)) / (2.0 * h);
        assert!(
            (numeric - dx.data()[i]).abs() < 1e-6,
            "input {i}: numeric {numeric}, backward {}",
            dx.data()[i]
        );
    }
}

#[test]
fn test_spatial_gradients_match_finite_difference() {
    init_tracing();
    check_gradients(false);
}

#[test]
fn test_fft_gradients_match_finite_difference() {
    init_tracing();
    check_gradients(true);
}

#[test]
fn test_shared_filter_receives_every_update() {
    init_tracing();
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2).with_eta(0.1))
        .input("input", 1, [3, 3, 1])
        .sum("left", 1)
        .sum("right", 1)
        .conv(
            "a",
            "input",
            "left",
            ConvOptions::new([1, 1, 1]).with_init(FilterInit::Constant(0.5)),
        )
        .conv(
            "b",
            "input",
            "right",
            ConvOptions::new([1, 1, 1]).tie_to("a"),
        )
        .build()
        .unwrap();

    let out = net
        .forward(volumes("input", vec![Cube::ones([3, 3, 1])]))
        .unwrap();
    assert!(out["left"][0].data().iter().all(|&v| v == 0.5));
    assert!(out["right"][0].data().iter().all(|&v| v == 0.5));

    let mut grads = volumes("left", vec![Cube::ones([3, 3, 1])]);
    grads.insert("right".to_string(), vec![Cube::ones([3, 3, 1])]);
    net.backward(grads).unwrap();

    // two updates of 0.1 * 9 each
    let a = net.filters("a").unwrap();
    let b = net.filters("b").unwrap();
    assert!((a[0].data()[0] + 1.3).abs() < 1e-12);
    assert_eq!(a, b);
}

#[test]
fn test_zap_notifies_every_edge_once() {
    init_tracing();
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(4))
        .input("input", 2, [6, 6, 1])
        .transfer("hidden", 3, TransferFn::Relu)
        .sum("pooled", 3)
        .conv("conv", "input", "hidden", ConvOptions::new([3, 3, 1]))
        .max_filter("pool", "hidden", "pooled", [2, 2, 1], [1, 1, 1])
        .build()
        .unwrap();
    assert_eq!(net.edge_count(), 9);

    let out = net
        .forward(volumes("input", vec![ramp([6, 6, 1], 0), ramp([6, 6, 1], 1)]))
        .unwrap();
    net.backward(volumes("pooled", out["pooled"].clone())).unwrap();

    assert_eq!(net.zap(), 9);
    assert_eq!(net.zap(), 9);
}

#[test]
fn test_max_filter_routes_gradient_to_argmax() {
    init_tracing();
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2))
        .input("input", 1, [4, 4, 1])
        .sum("pooled", 1)
        .max_filter("pool", "input", "pooled", [2, 2, 1], [1, 1, 1])
        .build()
        .unwrap();

    let x = Cube::new((0..16).map(|v| v as Real).collect(), [4, 4, 1]).unwrap();
    let out = net.forward(volumes("input", vec![x.clone()])).unwrap();
    let pooled = &out["pooled"][0];
    assert_eq!(pooled.shape(), &[3, 3, 1]);
    for i in 0..3 {
        for j in 0..3 {
            assert_eq!(pooled.get([i, j, 0]), x.get([i + 1, j + 1, 0]));
        }
    }

    let grads = net
        .backward(volumes("pooled", vec![Cube::ones([3, 3, 1])]))
        .unwrap();
    let g = &grads["input"][0];
    for i in 0..4 {
        for j in 0..4 {
            let expected = if i >= 1 && j >= 1 { 1.0 } else { 0.0 };
            assert_eq!(g.get([i, j, 0]), expected, "at ({i}, {j})");
        }
    }
}

fn two_branches() -> Network {
    NetworkBuilder::new(NetworkConfig::default().with_threads(2).with_eta(0.0))
        .input("input", 1, [3, 3, 1])
        .sum("output", 1)
        .conv(
            "a",
            "input",
            "output",
            ConvOptions::new([1, 1, 1]).with_init(FilterInit::Constant(1.0)),
        )
        .conv(
            "b",
            "input",
            "output",
            ConvOptions::new([1, 1, 1]).with_init(FilterInit::Constant(2.0)),
        )
        .build()
        .unwrap()
}

#[test]
fn test_disabled_edges_drop_contributions() {
    init_tracing();
    let mut net = two_branches();
    let input = || volumes("input", vec![Cube::ones([3, 3, 1])]);

    let out = net.forward(input()).unwrap();
    assert!(out["output"][0].data().iter().all(|&v| v == 3.0));

    net.set_enabled("b", false).unwrap();
    let out = net.forward(input()).unwrap();
    assert!(out["output"][0].data().iter().all(|&v| v == 1.0));
    let grads = net
        .backward(volumes("output", vec![Cube::ones([3, 3, 1])]))
        .unwrap();
    assert!(grads["input"][0].data().iter().all(|&v| v == 1.0));

    net.set_enabled("b", true).unwrap();
    let out = net.forward(input()).unwrap();
    assert!(out["output"][0].data().iter().all(|&v| v == 3.0));
}

#[test]
fn test_forward_without_enabled_inputs_fails() {
    let mut net = two_branches();
    net.set_enabled("a", false).unwrap();
    net.set_enabled("b", false).unwrap();
    let err = net.forward(volumes("input", vec![Cube::ones([3, 3, 1])]));
    assert!(matches!(err, Err(ZnnError::Topology(_))));
    assert!(matches!(
        net.set_enabled("missing", true),
        Err(ZnnError::UnknownEdges(_))
    ));
}

#[test]
fn test_deconv_output_grows() {
    init_tracing();
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2))
        .input("input", 1, [3, 3, 1])
        .sum("output", 1)
        .conv(
            "up",
            "input",
            "output",
            ConvOptions::new([3, 3, 1])
                .with_stride([2, 2, 1])
                .deconv()
                .with_init(FilterInit::Constant(1.0)),
        )
        .build()
        .unwrap();

    // 3 + (3 - 1) * 2
    assert_eq!(net.node_size("output").unwrap(), [7, 7, 1]);
    let out = net
        .forward(volumes("input", vec![Cube::ones([3, 3, 1])]))
        .unwrap();
    assert_eq!(out["output"][0].shape(), &[7, 7, 1]);
    assert_eq!(out["output"][0].sum(), 81.0);

    let grads = net
        .backward(volumes("output", vec![Cube::ones([7, 7, 1])]))
        .unwrap();
    assert_eq!(grads["input"][0].shape(), &[3, 3, 1]);
    assert!(grads["input"][0].data().iter().all(|&v| v == 9.0));
}

#[test]
#[should_panic(expected = "last_input")]
fn test_backward_before_forward_panics() {
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(1))
        .input("input", 1, [4, 4, 1])
        .sum("output", 1)
        .conv("conv", "input", "output", ConvOptions::new([2, 2, 1]))
        .build()
        .unwrap();
    let _ = net.backward(volumes("output", vec![Cube::ones([3, 3, 1])]));
}

#[test]
fn test_traversal_validates_volumes() {
    let mut net = two_branches();
    assert!(matches!(
        net.forward(volumes("input", vec![])),
        Err(ZnnError::ChannelCount { expected: 1, got: 0, .. })
    ));
    assert!(matches!(
        net.forward(volumes("input", vec![Cube::ones([2, 3, 1])])),
        Err(ZnnError::VolumeSize { .. })
    ));
    let mut bogus = volumes("input", vec![Cube::ones([3, 3, 1])]);
    bogus.insert("nope".to_string(), vec![]);
    assert!(matches!(net.forward(bogus), Err(ZnnError::UnknownNodes(_))));
    assert!(matches!(
        net.forward(volumes("output", vec![Cube::ones([3, 3, 1])])),
        Err(ZnnError::Topology(_))
    ));
}

#[test]
fn test_builder_rejects_inconsistent_topologies() {
    let config = || NetworkConfig::default().with_threads(1);

    // two paths disagree on the size of "output"
    let err = NetworkBuilder::new(config())
        .input("input", 1, [5, 5, 1])
        .sum("output", 1)
        .conv("a", "input", "output", ConvOptions::new([3, 3, 1]))
        .conv("b", "input", "output", ConvOptions::new([2, 2, 1]))
        .build();
    assert!(matches!(err, Err(ZnnError::Topology(_))));

    let err = NetworkBuilder::new(config())
        .input("input", 1, [5, 5, 1])
        .sum("x", 1)
        .sum("y", 1)
        .conv("in", "input", "x", ConvOptions::new([1, 1, 1]))
        .dummy("xy", "x", "y")
        .dummy("yx", "y", "x")
        .build();
    assert!(matches!(err, Err(ZnnError::Topology(_))));

    let err = NetworkBuilder::new(config().with_fft(true))
        .input("input", 1, [5, 5, 1])
        .sum("output", 1)
        .conv("up", "input", "output", ConvOptions::new([2, 2, 1]).deconv())
        .build();
    assert!(matches!(err, Err(ZnnError::Config(_))));

    let err = NetworkBuilder::new(config())
        .input("input", 1, [5, 5, 1])
        .sum("output", 1)
        .conv("a", "input", "output", ConvOptions::new([2, 2, 1]).tie_to("ghost"))
        .build();
    assert!(matches!(err, Err(ZnnError::UnknownEdges(_))));

    let err = NetworkBuilder::new(config())
        .input("input", 1, [2, 2, 1])
        .sum("output", 1)
        .conv("big", "input", "output", ConvOptions::new([3, 3, 1]))
        .build();
    assert!(matches!(err, Err(ZnnError::Topology(_))));

    let err = NetworkBuilder::new(config())
        .input("input", 1, [5, 5, 1])
        .sum("output", 1)
        .conv("a", "input", "nowhere", ConvOptions::new([1, 1, 1]))
        .build();
    assert!(matches!(err, Err(ZnnError::UnknownNodes(_))));
}

#[test]
fn test_learning_rate_setters() {
    let mut net = two_branches();
    net.set_eta(0.5).unwrap();
    assert_eq!(net.config().eta, 0.5);
    net.set_momentum(0.9).unwrap();
    assert!(matches!(net.set_momentum(1.5), Err(ZnnError::Config(_))));
    assert_eq!(net.config().momentum, 0.9);
}

#[test]
fn test_config_loaded_from_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "threads": 2, "eta": 0.25, "fft": true }}"#).unwrap();

    let config = NetworkConfig::from_path(file.path()).unwrap();
    assert_eq!(config.threads, Some(2));
    assert_eq!(config.eta, 0.25);
    assert!(config.fft);

    let mut net = NetworkBuilder::new(config)
        .input("input", 1, [4, 4, 1])
        .sum("output", 1)
        .conv(
            "conv",
            "input",
            "output",
            ConvOptions::new([2, 2, 1]).with_init(FilterInit::Constant(0.25)),
        )
        .build()
        .unwrap();
    let out = net
        .forward(volumes("input", vec![Cube::ones([4, 4, 1])]))
        .unwrap();
    assert_close(&out["output"][0], &Cube::ones([3, 3, 1]), 1e-9);
}

#[test]
fn test_dummy_edges_pass_values_through() {
    let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2))
        .input("input", 2, [2, 3, 1])
        .transfer("output", 2, TransferFn::Linear(2.0, 1.0))
        .dummy("same", "input", "output")
        .build()
        .unwrap();

    let x = vec![ramp([2, 3, 1], 0), ramp([2, 3, 1], 5)];
    let out = net.forward(volumes("input", x.clone())).unwrap();
    for (y, x) in out["output"].iter().zip(&x) {
        assert_close(y, &x.map(|v| 2.0 * v + 1.0), 1e-12);
    }

    let grads = net
        .backward(volumes("output", vec![Cube::ones([2, 3, 1]); 2]))
        .unwrap();
    for g in &grads["input"] {
        assert!(g.data().iter().all(|&v| v == 2.0));
    }
    assert_eq!(net.zap(), 2);
}

// input -a-> m -b-> n -c-> out, plus m -d-> out. Unit 1x1 filters, no learning.
fn detour(fft: bool) -> Network {
    let unit = || ConvOptions::new([1, 1, 1]).with_init(FilterInit::Constant(1.0));
    NetworkBuilder::new(
        NetworkConfig::default()
            .with_threads(2)
            .with_eta(0.0)
            .with_fft(fft),
    )
    .input("input", 1, [2, 2, 1])
    .sum("m", 1)
    .sum("n", 1)
    .sum("out", 1)
    .conv("a", "input", "m", unit())
    .conv("b", "m", "n", unit())
    .conv("c", "n", "out", unit())
    .conv("d", "m", "out", unit())
    .build()
    .unwrap()
}

fn check_dead_end_branch(fft: bool) {
    let mut net = detour(fft);
    assert_eq!(net.outputs(), vec!["out".to_string()]);
    net.set_enabled("c", false).unwrap();

    let x = ramp([2, 2, 1], 3);
    for pass in 0..3 {
        let out = net.forward(volumes("input", vec![x.clone()])).unwrap();
        assert_close(&out["out"][0], &x, 1e-9);
        let grads = net
            .backward(volumes("out", vec![Cube::ones([2, 2, 1])]))
            .unwrap();
        for v in grads["input"][0].data() {
            assert!((v - 1.0).abs() < 1e-9, "pass {pass}: gradient {v}");
        }
    }

    net.set_enabled("c", true).unwrap();
    let out = net.forward(volumes("input", vec![x.clone()])).unwrap();
    assert_close(&out["out"][0], &x.map(|v| 2.0 * v), 1e-9);
    let grads = net
        .backward(volumes("out", vec![Cube::ones([2, 2, 1])]))
        .unwrap();
    for v in grads["input"][0].data() {
        assert!((v - 2.0).abs() < 1e-9, "gradient {v} after re-enabling");
    }
}

#[test]
fn test_dead_end_branch_carries_no_gradient() {
    init_tracing();
    check_dead_end_branch(false);
}

#[test]
fn test_dead_end_branch_carries_no_gradient_fft() {
    init_tracing();
    check_dead_end_branch(true);
}

#[test]
fn test_pooling_dilates_the_layers_below() {
    init_tracing();
    let x = ramp([10, 10, 1], 2);
    let h = x
        .convolve_sparse(&Cube::ones([3, 3, 1]), [1, 1, 1])
        .unwrap();
    let (p, _) = h.max_filter([2, 2, 1], [1, 1, 1]).unwrap();
    let expected = p
        .convolve_sparse(&Cube::filled([3, 3, 1], 0.5), [2, 2, 1])
        .unwrap();

    for fft in [false, true] {
        let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2).with_fft(fft))
            .input("input", 1, [10, 10, 1])
            .sum("hidden", 1)
            .sum("pooled", 1)
            .sum("output", 1)
            .conv(
                "conv1",
                "input",
                "hidden",
                ConvOptions::new([3, 3, 1]).with_init(FilterInit::Constant(1.0)),
            )
            .max_filter("pool", "hidden", "pooled", [2, 2, 1], [2, 2, 1])
            .conv(
                "conv2",
                "pooled",
                "output",
                ConvOptions::new([3, 3, 1]).with_init(FilterInit::Constant(0.5)),
            )
            .build()
            .unwrap();

        assert_eq!(net.node_stride("hidden").unwrap(), [1, 1, 1]);
        assert_eq!(net.node_stride("pooled").unwrap(), [2, 2, 1]);
        assert_eq!(net.node_size("output").unwrap(), [3, 3, 1]);
        assert_eq!(net.fov(), [8, 8, 1]);
        assert_eq!(net.input_size_for([3, 3, 1]), [10, 10, 1]);

        let out = net.forward(volumes("input", vec![x.clone()])).unwrap();
        assert_close(&out["output"][0], &expected, 1e-9);
    }
}
