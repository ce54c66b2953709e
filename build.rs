// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
// 构建脚本: 静态链接 FFmpeg 时补齐 Windows 系统库
fn main() {
    #[cfg(all(target_os = "windows", target_env = "msvc"))]
    {
        // x264 编码器 / Intel QSV
        for lib in ["libx264", "libmfx"] {
            println!("cargo:rustc-link-lib=dylib={lib}");
        }

        // dshow 摄像头采集依赖 OLE 自动化和 VFW
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
