#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    use tch::{Device, Kind, Tensor};
    use tempfile::tempdir;

    use flowjson::{
        convert_file, ConvertOptions, Converter, Error, FlowField, JsonStyle, OffsetGrid,
        Rounding,
    };

    fn scenario_tensor() -> Tensor {
        // dx = [[1.2, 1.8], [-0.5, 0.5]], dy = 0
        Tensor::of_slice(&[1.2f32, 1.8, -0.5, 0.5, 0.0, 0.0, 0.0, 0.0]).view([1, 2, 2, 2])
    }

    /// Copies a checked-in fixture into `dir` so the JSON lands outside the repo.
    fn fixture(dir: &Path, name: &str) -> PathBuf {
        let source = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("data")
            .join(name);
        let target = dir.join(name);
        fs::copy(&source, &target).unwrap();
        target
    }

    fn read_grid(path: &Path) -> OffsetGrid {
        let json = fs::read_to_string(path).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_scenario_torch_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.pth");
        scenario_tensor().save(&input).unwrap();

        let output = convert_file(&input).unwrap();

        assert_eq!(output, dir.path().join("flow.json"));
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "[[[1,0],[2,0]],[[0,0],[0,0]]]"
        );
    }

    #[test]
    fn test_scenario_half_away() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.pth");
        scenario_tensor().save(&input).unwrap();

        let converter = Converter::new(ConvertOptions {
            rounding: Rounding::HalfAwayFromZero,
            ..Default::default()
        });
        let output = converter.convert_file(&input).unwrap();

        assert_eq!(
            read_grid(&output),
            vec![vec![[1, 0], [2, 0]], vec![[-1, 0], [1, 0]]]
        );
    }

    #[test]
    fn test_npy_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.npy");
        scenario_tensor().write_npy(&input).unwrap();

        let output = convert_file(&input).unwrap();

        assert_eq!(output, dir.path().join("flow.json"));
        assert_eq!(
            read_grid(&output),
            vec![vec![[1, 0], [2, 0]], vec![[0, 0], [0, 0]]]
        );
    }

    #[test]
    fn test_npz_input_picks_flow_entry() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flows.npz");
        let decoy = Tensor::ones(&[1, 2, 2, 2], (Kind::Float, Device::Cpu)) * 7.0;
        Tensor::write_npz(&[("decoy", &decoy), ("flow", &scenario_tensor())], &input).unwrap();

        let output = convert_file(&input).unwrap();

        assert_eq!(
            read_grid(&output),
            vec![vec![[1, 0], [2, 0]], vec![[0, 0], [0, 0]]]
        );
    }

    #[test]
    fn test_named_torch_archive() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.ot");
        Tensor::save_multi(&[("flow", &scenario_tensor())], &input).unwrap();

        let flow = FlowField::load(&input).unwrap();

        assert_eq!(flow.dims(), (2, 2));
        assert!((flow.dx(0, 1) - 1.8).abs() < 1e-6);
    }

    #[test]
    fn test_python_torch_save_tensor() {
        let dir = tempdir().unwrap();
        let input = fixture(dir.path(), "flow.pth");

        let output = convert_file(&input).unwrap();

        assert_eq!(output, dir.path().join("flow.json"));
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "[[[1,0],[2,0]],[[0,0],[0,0]]]"
        );
    }

    #[test]
    fn test_python_torch_save_state_dict() {
        // float64 storage shared by "pad" and "flow", "flow" starting at element 2
        let dir = tempdir().unwrap();
        let input = fixture(dir.path(), "flow_state.pth");

        let flow = FlowField::load(&input).unwrap();
        assert_eq!(flow.dims(), (2, 2));
        assert_eq!(flow.dx(0, 0), 2.5);
        assert_eq!(flow.dy(1, 1), 8.0);

        let output = convert_file(&input).unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "[[[2,1],[4,-1]],[[-2,7],[0,8]]]"
        );
    }

    #[test]
    fn test_truncated_torch_save_pickle() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("broken.pth");
        let mut writer = zip::ZipWriter::new(fs::File::create(&input).unwrap());
        writer
            .start_file("broken/data.pkl", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"\x80\x02(K").unwrap();
        writer.finish().unwrap();

        match convert_file(&input).unwrap_err() {
            Error::Pickle { path, .. } => assert_eq!(path, input),
            other => panic!("expected pickle error, got {:?}", other),
        }
        assert!(!dir.path().join("broken.json").exists());
    }

    #[test]
    fn test_all_zero_full_size() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("zeros.pth");
        Tensor::zeros(&[1, 2, 512, 512], (Kind::Float, Device::Cpu))
            .save(&input)
            .unwrap();

        let converter = Converter::new(ConvertOptions {
            expected_size: Some((512, 512)),
            ..Default::default()
        });
        let grid = read_grid(&converter.convert_file(&input).unwrap());

        assert_eq!(grid.len(), 512);
        assert!(grid.iter().all(|row| row.len() == 512));
        assert!(grid.iter().flatten().all(|o| *o == [0, 0]));
    }

    #[test]
    fn test_elementwise_rounding_matches_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("ramp.pth");
        let values = (0..2 * 3 * 5)
            .map(|i| i as f32 * 0.37 - 4.0)
            .collect::<Vec<_>>();
        let ramp = Tensor::of_slice(&values).view([1, 2, 3, 5]);
        ramp.save(&input).unwrap();

        let flow = FlowField::load(&input).unwrap();
        let grid = read_grid(&convert_file(&input).unwrap());

        assert_eq!(grid.len(), 3);
        for (row, offsets) in grid.iter().enumerate() {
            assert_eq!(offsets.len(), 5);
            for (col, offset) in offsets.iter().enumerate() {
                assert_eq!(offset[0], flow.dx(row, col).round_ties_even() as i64);
                assert_eq!(offset[1], flow.dy(row, col).round_ties_even() as i64);
            }
        }
    }

    #[test]
    fn test_idempotent_output() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.pth");
        (Tensor::rand(&[1, 2, 16, 16], (Kind::Float, Device::Cpu)) * 40.0 - 20.0)
            .save(&input)
            .unwrap();

        let output = convert_file(&input).unwrap();
        let first = fs::read(&output).unwrap();
        let output = convert_file(&input).unwrap();
        let second = fs::read(&output).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_overwrites_and_custom_output() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.pth");
        let target = dir.path().join("out").with_extension("json");
        scenario_tensor().save(&input).unwrap();
        fs::write(&target, "not json at all, and longer than the real output").unwrap();

        let converter = Converter::new(ConvertOptions {
            output: Some(target.clone()),
            style: JsonStyle::Pretty,
            ..Default::default()
        });
        let output = converter.convert_file(&input).unwrap();

        assert_eq!(output, target);
        assert!(!dir.path().join("flow.json").exists());
        assert!(fs::read_to_string(&target).unwrap().contains('\n'));
        assert_eq!(
            read_grid(&target),
            vec![vec![[1, 0], [2, 0]], vec![[0, 0], [0, 0]]]
        );
    }

    #[test]
    fn test_unwritable_output_is_io_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flow.pth");
        let target = dir.path().join("missing").join("sub").join("out.json");
        scenario_tensor().save(&input).unwrap();

        let converter = Converter::new(ConvertOptions {
            output: Some(target.clone()),
            ..Default::default()
        });

        match converter.convert_file(&input).unwrap_err() {
            Error::Io { path, .. } => assert_eq!(path, target),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_channel_dim_is_shape_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flat.pth");
        Tensor::zeros(&[1, 512, 512], (Kind::Float, Device::Cpu))
            .save(&input)
            .unwrap();

        let err = convert_file(&input).unwrap_err();

        assert!(matches!(err, Error::Shape { .. }));
        assert!(!dir.path().join("flat.json").exists());
    }

    #[test]
    fn test_garbage_file_is_tensor_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("garbage.pth");
        fs::write(&input, b"definitely not a tensor").unwrap();

        let err = convert_file(&input).unwrap_err();

        assert!(matches!(err, Error::Tensor(_)));
        assert!(!dir.path().join("garbage.json").exists());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = convert_file(dir.path().join("absent.pth")).unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
    }
}
