use pyo3::prelude::*;

pub mod geometry;
pub mod refraction;
pub mod scene;
pub mod terrain;

#[pymodule]
fn subgrid_radiation(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    // Register submodules
    register_terrain_module(py_module)?;

    py_module.add(
        "__doc__",
        "Subgrid correction factors for direct shortwave radiation over complex terrain.",
    )?;

    Ok(())
}

fn register_terrain_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "terrain")?;
    submodule.add(
        "__doc__",
        "Ray-traced correction of the direct beam on tilted, shadowed terrain.",
    )?;
    submodule.add_class::<terrain::TerrainRunner>()?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
